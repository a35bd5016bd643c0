//! Local [`JobRunner`] that renders manifests with the `ffmpeg` binary.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{ChildStderr, Command};
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    InputSource, JobManifest, JobRunner, MergeKind, OutputFormat, RunnerError, RunnerJobId,
    RunnerState, RunnerStatus,
};

const ERROR_TAIL_LINES: usize = 8;

/// Finished renders nobody asked about are forgotten after this long.
const FINISHED_RETENTION: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FfmpegRunnerConfig {
    /// Looked up on `PATH` when unset.
    pub ffmpeg_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub max_concurrent: usize,
}

impl Default for FfmpegRunnerConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            output_dir: project::app_data_dir().join("renders"),
            max_concurrent: 1,
        }
    }
}

impl FfmpegRunnerConfig {
    pub fn with_ffmpeg_path(mut self, path: PathBuf) -> Self {
        self.ffmpeg_path = Some(path);
        self
    }

    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.output_dir = dir;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }
}

struct LocalJob {
    status: RunnerStatus,
    cancel: Option<oneshot::Sender<()>>,
    finished_at: Option<Instant>,
}

#[derive(Default)]
struct PoolState {
    jobs: HashMap<RunnerJobId, LocalJob>,
    waiting: VecDeque<RunnerJobId>,
}

impl PoolState {
    fn prune_finished(&mut self, now: Instant) {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| {
            job.finished_at
                .map_or(true, |at| now.saturating_duration_since(at) < FINISHED_RETENTION)
        });
        let pruned = before - self.jobs.len();
        if pruned > 0 {
            debug!(pruned, "forgot unclaimed finished renders");
        }
    }
}

type SharedState = Arc<Mutex<PoolState>>;

pub struct FfmpegRunner {
    config: FfmpegRunnerConfig,
    state: SharedState,
    permits: Arc<Semaphore>,
}

impl FfmpegRunner {
    pub fn new(config: FfmpegRunnerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            state: SharedState::default(),
            permits,
        }
    }

    pub fn config(&self) -> &FfmpegRunnerConfig {
        &self.config
    }

    fn locate(&self) -> Result<PathBuf, RunnerError> {
        match &self.config.ffmpeg_path {
            Some(path) if path.is_file() => Ok(path.clone()),
            Some(path) => Err(RunnerError::Unavailable(format!(
                "ffmpeg not found at {}",
                path.display()
            ))),
            None => which::which("ffmpeg")
                .map_err(|e| RunnerError::Unavailable(format!("ffmpeg not found on PATH: {e}"))),
        }
    }
}

#[async_trait]
impl JobRunner for FfmpegRunner {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn enqueue(&self, manifest: &JobManifest) -> Result<RunnerJobId, RunnerError> {
        let binary = self.locate()?;
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let id = RunnerJobId::new(format!("ffmpeg-{}", Uuid::new_v4().simple()));
        let output = render_path(&self.config.output_dir, manifest);
        let args = build_ffmpeg_args(manifest, &output.to_string_lossy());
        let total_us = (manifest.output_duration_seconds() * 1_000_000.0) as u64;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.prune_finished(Instant::now());
            state.jobs.insert(
                id.clone(),
                LocalJob {
                    status: RunnerStatus::queued(None),
                    cancel: Some(cancel_tx),
                    finished_at: None,
                },
            );
            state.waiting.push_back(id.clone());
        }
        debug!(runner_job = %id, job = %manifest.job_id, output = %output.display(), "render queued");

        let task = RenderTask {
            id: id.clone(),
            binary,
            args,
            output,
            total_us,
            state: self.state.clone(),
        };
        tokio::spawn(task.run(self.permits.clone(), cancel_rx));
        Ok(id)
    }

    /// A finished render is reported once and then forgotten.
    async fn status(&self, id: &RunnerJobId) -> Result<RunnerStatus, RunnerError> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get(id)
            .ok_or_else(|| RunnerError::UnknownJob(id.clone()))?;
        if job.status.state.is_finished() {
            let job = state.jobs.remove(id);
            return job
                .map(|job| job.status)
                .ok_or_else(|| RunnerError::UnknownJob(id.clone()));
        }
        let mut status = job.status.clone();
        if let RunnerState::Queued { .. } = status.state {
            let position = state
                .waiting
                .iter()
                .position(|w| w == id)
                .map(|p| p as u32 + 1);
            status.state = RunnerState::Queued { position };
        }
        Ok(status)
    }

    async fn cancel(&self, id: &RunnerJobId) -> Result<(), RunnerError> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| RunnerError::UnknownJob(id.clone()))?;
        if let Some(tx) = job.cancel.take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}

struct RenderTask {
    id: RunnerJobId,
    binary: PathBuf,
    args: Vec<String>,
    output: PathBuf,
    total_us: u64,
    state: SharedState,
}

impl RenderTask {
    async fn run(self, permits: Arc<Semaphore>, mut cancel: oneshot::Receiver<()>) {
        let _permit = tokio::select! {
            permit = permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.finish(RunnerStatus::failed("render pool closed"));
                    return;
                }
            },
            _ = &mut cancel => {
                self.finish(RunnerStatus::cancelled());
                return;
            }
        };
        self.start();

        let mut child = match Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.finish(RunnerStatus::failed(format!("ffmpeg spawn failed: {e}")));
                return;
            }
        };

        let mut lines = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut tail: VecDeque<String> = VecDeque::with_capacity(ERROR_TAIL_LINES);
        loop {
            tokio::select! {
                _ = &mut cancel => {
                    if let Err(e) = child.kill().await {
                        warn!(runner_job = %self.id, error = %e, "failed to kill ffmpeg");
                    }
                    self.finish(RunnerStatus::cancelled());
                    return;
                }
                line = next_line(&mut lines) => match line {
                    Some(line) => self.handle_line(&line, &mut tail),
                    None => break,
                },
            }
        }

        let exit = tokio::select! {
            exit = child.wait() => Some(exit),
            _ = &mut cancel => None,
        };
        let Some(exit) = exit else {
            let _ = child.kill().await;
            self.finish(RunnerStatus::cancelled());
            return;
        };
        let status = match exit {
            Ok(exit) if exit.success() => {
                RunnerStatus::succeeded(self.output.to_string_lossy().into_owned())
            }
            Ok(exit) => {
                let detail = tail.into_iter().collect::<Vec<_>>().join("; ");
                RunnerStatus::failed(format!("ffmpeg exited with {exit}: {detail}"))
            }
            Err(e) => RunnerStatus::failed(format!("waiting for ffmpeg failed: {e}")),
        };
        self.finish(status);
    }

    fn start(&self) {
        let mut state = self.state.lock();
        state.waiting.retain(|w| w != &self.id);
        if let Some(job) = state.jobs.get_mut(&self.id) {
            job.status = RunnerStatus::running(0.0).with_step("Encoding");
        }
    }

    fn handle_line(&self, line: &str, tail: &mut VecDeque<String>) {
        match parse_progress_line(line, self.total_us) {
            Some(Some(percent)) => {
                if let Some(job) = self.state.lock().jobs.get_mut(&self.id) {
                    job.status.progress = job.status.progress.max(percent);
                }
            }
            Some(None) => {}
            None => {
                if tail.len() == ERROR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.trim().to_string());
            }
        }
    }

    fn finish(&self, status: RunnerStatus) {
        debug!(runner_job = %self.id, state = ?status.state, "render finished");
        let mut state = self.state.lock();
        state.waiting.retain(|w| w != &self.id);
        if let Some(job) = state.jobs.get_mut(&self.id) {
            job.status = status;
            job.cancel = None;
            job.finished_at = Some(Instant::now());
        }
    }
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStderr>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

/// `None` for lines that are not `-progress` output; `Some(None)` for
/// progress keys that carry no position. Percentages stay below 100 until
/// the process exits.
fn parse_progress_line(line: &str, total_us: u64) -> Option<Option<f32>> {
    let (key, value) = line.trim().split_once('=')?;
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    // ffmpeg reports out_time_ms in microseconds as well
    if key != "out_time_us" && key != "out_time_ms" {
        return Some(None);
    }
    let us: u64 = value.trim().parse().ok()?;
    if total_us == 0 {
        return Some(None);
    }
    Some(Some((us as f32 / total_us as f32 * 100.0).min(99.0)))
}

fn secs(v: f64) -> String {
    format!("{v:.3}")
}

/// Full ffmpeg argument list for a manifest: videos concatenated in order,
/// audio delayed to its start time and mixed.
pub fn build_ffmpeg_args(manifest: &JobManifest, output: &str) -> Vec<String> {
    let s = &manifest.settings;
    let (w, h, fps) = (s.width, s.height, s.fps);
    let videos: Vec<&InputSource> = manifest.videos().collect();
    let audio: Vec<&InputSource> = manifest.audio().collect();

    let mut args: Vec<String> = ["-y", "-hide_banner", "-nostats", "-loglevel", "error"]
        .into_iter()
        .map(String::from)
        .collect();

    if videos.is_empty() {
        let total = manifest.timeline_duration_seconds().max(1.0);
        args.extend([
            "-f".into(),
            "lavfi".into(),
            "-t".into(),
            secs(total),
            "-i".into(),
            format!("color=c=black:s={w}x{h}:r={fps}"),
        ]);
    } else {
        for v in &videos {
            if let Some(d) = v.duration_seconds {
                args.push("-t".into());
                args.push(secs(d));
            }
            args.push("-i".into());
            args.push(v.url.clone());
        }
    }
    let video_inputs = videos.len().max(1);
    for a in &audio {
        args.push("-i".into());
        args.push(a.url.clone());
    }

    let mut filters: Vec<String> = Vec::new();
    let mut vouts = String::new();
    for i in 0..video_inputs {
        filters.push(format!(
            "[{i}:v]scale={w}:{h}:force_original_aspect_ratio=decrease:flags=lanczos,\
             pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps},format=yuv420p[v{i}]"
        ));
        vouts.push_str(&format!("[v{i}]"));
    }
    filters.push(format!("{vouts}concat=n={video_inputs}:v=1:a=0[vout]"));

    let mut aouts = String::new();
    for (j, a) in audio.iter().enumerate() {
        let idx = video_inputs + j;
        let delay_ms = (a.start_time_seconds * 1000.0).round() as u64;
        let trim = a
            .duration_seconds
            .map(|d| format!("atrim=0:{},", secs(d)))
            .unwrap_or_default();
        filters.push(format!(
            "[{idx}:a]{trim}adelay={delay_ms}|{delay_ms},volume={:.3},aresample=async=1[a{j}]",
            a.volume
        ));
        aouts.push_str(&format!("[a{j}]"));
    }
    let has_audio = !audio.is_empty();
    if has_audio {
        filters.push(format!(
            "{aouts}amix=inputs={}:normalize=0:duration=longest[aout]",
            audio.len()
        ));
    }

    args.push("-filter_complex".into());
    args.push(filters.join(";"));
    args.push("-map".into());
    args.push("[vout]".into());
    if has_audio {
        args.push("-map".into());
        args.push("[aout]".into());
    } else {
        args.push("-an".into());
    }

    args.push("-c:v".into());
    args.push(s.video_codec.clone());
    if s.is_vpx() {
        args.extend(["-b:v".into(), "0".into(), "-crf".into(), s.crf.to_string()]);
        args.extend(["-row-mt".into(), "1".into()]);
    } else {
        args.extend(["-crf".into(), s.crf.to_string()]);
        args.extend(["-preset".into(), s.preset.clone()]);
    }
    args.push("-pix_fmt".into());
    args.push("yuv420p".into());
    if has_audio {
        args.extend(["-c:a".into(), s.audio_codec.clone(), "-b:a".into(), "192k".into()]);
    }
    if matches!(manifest.output_format, OutputFormat::Mp4 | OutputFormat::Mov) {
        args.push("-movflags".into());
        args.push("+faststart".into());
    }
    if manifest.kind == MergeKind::Preview && manifest.preview_duration_seconds.is_some() {
        args.push("-t".into());
        args.push(secs(manifest.output_duration_seconds()));
    }

    args.push("-progress".into());
    args.push("pipe:2".into());
    args.push(output.to_string());
    args
}

/// Where a finished render for `manifest` would land under `dir`.
pub fn render_path(dir: &Path, manifest: &JobManifest) -> PathBuf {
    dir.join(format!(
        "{}-{}-{}.{}",
        manifest.kind,
        manifest.job_id,
        manifest.attempt,
        manifest.output_format.extension()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EncodeSettings, MergeJobId, QualityTier};

    fn manifest(kind: MergeKind, format: OutputFormat, inputs: Vec<InputSource>) -> JobManifest {
        JobManifest {
            job_id: MergeJobId::new(),
            kind,
            attempt: 0,
            inputs,
            settings: EncodeSettings::resolve(QualityTier::Web, format, None).unwrap(),
            output_format: format,
            preview_duration_seconds: (kind == MergeKind::Preview).then_some(5.0),
        }
    }

    fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_merge_args_concat_and_mix() {
        let m = manifest(
            MergeKind::FullMerge,
            OutputFormat::Mp4,
            vec![
                InputSource::video("a.mp4", 0.0).with_duration(4.0),
                InputSource::video("b.mp4", 4.0).with_duration(6.0),
                InputSource::audio("n.mp3", 4.0, 0.5).with_duration(3.0),
            ],
        );
        let args = build_ffmpeg_args(&m, "/out/x.mp4");
        let graph = arg_after(&args, "-filter_complex").unwrap();
        assert!(graph.contains("concat=n=2:v=1:a=0[vout]"));
        assert!(graph.contains("[2:a]atrim=0:3.000,adelay=4000|4000,volume=0.500"));
        assert!(graph.contains("amix=inputs=1"));
        assert_eq!(arg_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(arg_after(&args, "-crf"), Some("28"));
        assert_eq!(arg_after(&args, "-movflags"), Some("+faststart"));
        assert_eq!(args.last().map(String::as_str), Some("/out/x.mp4"));
        assert!(!args.iter().any(|a| a == "-an"));
    }

    #[test]
    fn test_preview_webm_without_audio() {
        let m = manifest(
            MergeKind::Preview,
            OutputFormat::WebM,
            vec![InputSource::video("a.mp4", 0.0).with_duration(20.0)],
        );
        let args = build_ffmpeg_args(&m, "p.webm");
        assert!(args.iter().any(|a| a == "-an"));
        assert_eq!(arg_after(&args, "-b:v"), Some("0"));
        assert!(arg_after(&args, "-movflags").is_none());
        assert_eq!(args.iter().filter(|a| *a == "-t").count(), 2);
        let t_positions: Vec<usize> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "-t")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(args[t_positions[1] + 1], "5.000");
    }

    #[test]
    fn test_audio_only_uses_black_frames() {
        let m = manifest(
            MergeKind::FullMerge,
            OutputFormat::Mov,
            vec![InputSource::audio("m.mp3", 1.0, 1.0).with_duration(9.0)],
        );
        let args = build_ffmpeg_args(&m, "o.mov");
        assert_eq!(arg_after(&args, "-f"), Some("lavfi"));
        assert_eq!(arg_after(&args, "-t"), Some("10.000"));
        assert!(arg_after(&args, "-filter_complex")
            .unwrap()
            .contains("[1:a]atrim"));
    }

    #[test]
    fn test_parse_progress_lines() {
        assert_eq!(parse_progress_line("out_time_us=5000000", 10_000_000), Some(Some(50.0)));
        assert_eq!(parse_progress_line("out_time_ms=20000000", 10_000_000), Some(Some(99.0)));
        assert_eq!(parse_progress_line("progress=continue", 10_000_000), Some(None));
        assert_eq!(parse_progress_line("out_time_us=N/A", 10_000_000), None);
        assert_eq!(parse_progress_line("Error opening input file a.mp4", 1), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FfmpegRunner::new(
            FfmpegRunnerConfig::default()
                .with_output_dir(dir.path().to_path_buf())
                .with_ffmpeg_path(dir.path().join("no-ffmpeg")),
        );
        let m = manifest(MergeKind::FullMerge, OutputFormat::Mp4, vec![InputSource::video("a", 0.0)]);
        let err = runner.enqueue(&m).await.unwrap_err();
        assert!(err.is_transient());
        let unknown = runner.status(&RunnerJobId::new("nope")).await.unwrap_err();
        assert!(matches!(unknown, RunnerError::UnknownJob(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_process_reports_output() {
        let Ok(binary) = which::which("true") else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let runner = FfmpegRunner::new(
            FfmpegRunnerConfig::default()
                .with_output_dir(dir.path().to_path_buf())
                .with_ffmpeg_path(binary),
        );
        let m = manifest(
            MergeKind::FullMerge,
            OutputFormat::Mp4,
            vec![InputSource::video("a.mp4", 0.0).with_duration(1.0)],
        );
        let id = runner.enqueue(&m).await.unwrap();
        let mut status = runner.status(&id).await.unwrap();
        for _ in 0..200 {
            if status.state == RunnerState::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = runner.status(&id).await.unwrap();
        }
        assert_eq!(status.state, RunnerState::Succeeded);
        assert_eq!(
            status.output_ref.map(PathBuf::from),
            Some(render_path(dir.path(), &m))
        );
        assert!(matches!(runner.status(&id).await, Err(RunnerError::UnknownJob(_))));
        assert!(runner.state.lock().jobs.is_empty());
    }

    #[test]
    fn test_unclaimed_finished_renders_are_pruned() {
        let mut pool = PoolState::default();
        let now = Instant::now();
        let job = |finished_at| LocalJob {
            status: RunnerStatus::succeeded("o.mp4"),
            cancel: None,
            finished_at,
        };
        pool.jobs.insert(RunnerJobId::new("running"), job(None));
        pool.jobs.insert(RunnerJobId::new("fresh"), job(Some(now)));
        pool.jobs.insert(RunnerJobId::new("stale"), job(Some(now)));

        pool.prune_finished(now + FINISHED_RETENTION / 2);
        assert_eq!(pool.jobs.len(), 3);
        pool.jobs.get_mut(&RunnerJobId::new("fresh")).unwrap().finished_at =
            Some(now + FINISHED_RETENTION);
        pool.prune_finished(now + FINISHED_RETENTION + Duration::from_secs(1));
        let mut left: Vec<&str> = pool.jobs.keys().map(RunnerJobId::as_str).collect();
        left.sort();
        assert_eq!(left, vec!["fresh", "running"]);
    }
}
