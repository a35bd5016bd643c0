use async_trait::async_trait;
use jobs::{
    FailureKind, InputSource, JobError, JobManifest, JobRunner, JobState, JobStore, MergeJobId,
    MergeKind, MergeOrchestrator, MergeRequest, OrchestratorConfig, OutputFormat,
    OverrideParameters, QualityTier, RunnerError, RunnerJobId, RunnerStatus, SqliteJobStore,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use timeline::{AudioCategory, AudioClip, Chapter, ChapterId, ShotType};
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};

/// Runner that replays a fixed list of statuses per enqueued job. The last
/// status of a script repeats forever.
struct ScriptedRunner {
    scripts: Mutex<VecDeque<Vec<RunnerStatus>>>,
    fallback: Vec<RunnerStatus>,
    enqueue_failures: Mutex<u32>,
    status_failures: Mutex<u32>,
    gate: Option<Arc<Semaphore>>,
    live: Mutex<HashMap<RunnerJobId, VecDeque<RunnerStatus>>>,
    manifests: Mutex<Vec<JobManifest>>,
    cancelled: Mutex<Vec<RunnerJobId>>,
}

impl ScriptedRunner {
    fn new(fallback: Vec<RunnerStatus>) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback,
            enqueue_failures: Mutex::new(0),
            status_failures: Mutex::new(0),
            gate: None,
            live: Mutex::new(HashMap::new()),
            manifests: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    fn failing_enqueues(self, n: u32) -> Self {
        *self.enqueue_failures.lock() = n;
        self
    }

    fn failing_status(self, n: u32) -> Self {
        *self.status_failures.lock() = n;
        self
    }

    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn manifests(&self) -> Vec<JobManifest> {
        self.manifests.lock().clone()
    }

    fn cancelled(&self) -> Vec<RunnerJobId> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl JobRunner for ScriptedRunner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn enqueue(&self, manifest: &JobManifest) -> Result<RunnerJobId, RunnerError> {
        {
            let mut failures = self.enqueue_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(RunnerError::Unavailable("connection refused".into()));
            }
        }
        let mut manifests = self.manifests.lock();
        manifests.push(manifest.clone());
        let id = RunnerJobId::new(format!("run-{}", manifests.len()));
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        self.live.lock().insert(id.clone(), script.into());
        Ok(id)
    }

    async fn status(&self, id: &RunnerJobId) -> Result<RunnerStatus, RunnerError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| RunnerError::Unavailable("gate closed".into()))?
                .forget();
        }
        {
            let mut failures = self.status_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(RunnerError::Unavailable("timed out".into()));
            }
        }
        let mut live = self.live.lock();
        let script = live
            .get_mut(id)
            .ok_or_else(|| RunnerError::UnknownJob(id.clone()))?;
        let status = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        status.ok_or_else(|| RunnerError::Unavailable("empty script".into()))
    }

    async fn cancel(&self, id: &RunnerJobId) -> Result<(), RunnerError> {
        self.cancelled.lock().push(id.clone());
        Ok(())
    }
}

fn videos(n: usize) -> MergeRequest {
    let inputs = (0..n)
        .map(|i| InputSource::video(format!("https://x/{i}.mp4"), i as f64 * 4.0).with_duration(4.0))
        .collect();
    MergeRequest::new(ChapterId::new(), inputs)
}

fn orchestrator(runner: &Arc<ScriptedRunner>) -> MergeOrchestrator {
    orchestrator_with(runner, OrchestratorConfig::default())
}

fn orchestrator_with(runner: &Arc<ScriptedRunner>, config: OrchestratorConfig) -> MergeOrchestrator {
    MergeOrchestrator::in_memory(runner.clone(), config)
}

async fn wait_until(orch: &MergeOrchestrator, id: MergeJobId, status: JobState) {
    for _ in 0..1_000 {
        if orch.poll(id).unwrap().status == status {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("job {id} never reached {status}");
}

fn story_chapter() -> Chapter {
    let mut chapter = Chapter::new("Chapter 2");
    let first = chapter
        .timeline
        .insert_shot(1, ShotType::KeyScene, None, Some(3.0))
        .unwrap();
    let second = chapter
        .timeline
        .insert_shot(2, ShotType::KeyScene, None, Some(5.0))
        .unwrap();
    chapter.timeline.set_video_source(first, "https://x/one.mp4").unwrap();
    chapter.timeline.set_video_source(second, "https://x/two.mp4").unwrap();
    chapter
        .audio
        .add_clip(AudioClip::generated(
            "line",
            2,
            AudioCategory::Character,
            "https://x/line.mp3",
            2.0,
            Some(0),
        ))
        .unwrap();
    chapter
        .audio
        .add_clip(AudioClip::new("bed", 1, AudioCategory::Ambiance, "https://x/bed.mp3", 8.0).with_volume(0.3))
        .unwrap();
    chapter
}

#[tokio::test(start_paused = true)]
async fn test_chapter_merge_reports_ordered_progress() {
    let runner = Arc::new(ScriptedRunner::new(vec![
        RunnerStatus::queued(Some(2)),
        RunnerStatus::queued(Some(1)),
        RunnerStatus::running(10.0).with_step("Encoding"),
        RunnerStatus::running(5.0),
        RunnerStatus::running(60.0),
        RunnerStatus::succeeded("https://cdn/chapter.mp4"),
    ]));
    let orch = orchestrator(&runner);
    let chapter = story_chapter();

    let job = orch
        .submit_merge(MergeRequest::for_chapter(&chapter).with_quality(QualityTier::High))
        .await
        .unwrap();
    assert_eq!(job.status, JobState::Queued);
    assert_eq!(job.chapter_id, chapter.id);
    let sub = orch.subscribe(job.id).unwrap();

    let done = orch.wait(job.id).await.unwrap();
    assert_eq!(done.status, JobState::Completed);
    assert_eq!(done.progress_percent, 100.0);
    assert_eq!(orch.download_result(job.id).unwrap(), "https://cdn/chapter.mp4");

    let events = sub.drain();
    assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(events
        .windows(2)
        .all(|w| w[0].progress_percent <= w[1].progress_percent));
    let positions: Vec<u32> = events.iter().filter_map(|e| e.queue_position).collect();
    assert_eq!(positions, vec![2, 1]);
    let processing = events
        .iter()
        .position(|e| e.status == JobState::Processing)
        .unwrap();
    let completed = events
        .iter()
        .position(|e| e.status == JobState::Completed)
        .unwrap();
    assert!(processing < completed);
    assert_eq!(completed, events.len() - 1);

    let manifests = runner.manifests();
    let manifest = &manifests[0];
    let urls: Vec<&str> = manifest.inputs.iter().map(|s| s.url.as_str()).collect();
    assert_eq!(
        urls,
        vec!["https://x/one.mp4", "https://x/two.mp4", "https://x/bed.mp3", "https://x/line.mp3"]
    );
    assert_eq!(manifest.inputs[3].start_time_seconds, 3.0);
    assert_eq!(manifest.settings.crf, 18);
}

#[tokio::test(start_paused = true)]
async fn test_rejects_invalid_requests() {
    let runner = Arc::new(ScriptedRunner::new(vec![RunnerStatus::succeeded("o")]));
    let orch = orchestrator(&runner);
    let chapter_id = ChapterId::new();

    let empty = MergeRequest::new(chapter_id, vec![]);
    assert!(matches!(orch.submit_merge(empty.clone()).await, Err(JobError::EmptyInput)));
    assert!(matches!(orch.submit_preview(empty).await, Err(JobError::EmptyInput)));

    let loud = MergeRequest::new(chapter_id, vec![InputSource::audio("https://x/a.mp3", 0.0, 1.2)]);
    assert!(matches!(orch.submit_merge(loud).await, Err(JobError::Validation(_))));

    let custom = videos(1).with_quality(QualityTier::Custom);
    assert!(matches!(orch.submit_merge(custom).await, Err(JobError::Validation(_))));

    let bad_res = videos(1).with_overrides(OverrideParameters {
        resolution: Some("wide".into()),
        ..Default::default()
    });
    assert!(orch.submit_merge(bad_res).await.is_err());

    assert!(orch.list_jobs(chapter_id).unwrap().is_empty());
    assert!(runner.manifests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_preview_caps_inputs_and_duration() {
    let runner = Arc::new(ScriptedRunner::new(vec![RunnerStatus::succeeded("p.mp4")]));
    let orch = orchestrator(&runner);

    let job = orch
        .submit_preview(videos(3).with_format(OutputFormat::WebM))
        .await
        .unwrap();
    assert_eq!(job.kind, MergeKind::Preview);
    assert_eq!(job.input_sources.len(), 2);
    assert_eq!(job.input_sources[1].url, "https://x/1.mp4");
    assert_eq!(job.preview_duration_seconds, Some(30.0));
    orch.wait(job.id).await.unwrap();

    let short = orch
        .submit_preview(videos(1).with_preview_duration(12.0))
        .await
        .unwrap();
    assert_eq!(short.preview_duration_seconds, Some(12.0));
    orch.wait(short.id).await.unwrap();

    let manifests = runner.manifests();
    assert_eq!(manifests[0].inputs.len(), 2);
    assert_eq!(manifests[0].kind, MergeKind::Preview);
    assert_eq!(manifests[0].settings.video_codec, "libvpx-vp9");
    assert_eq!(manifests[1].output_duration_seconds(), 4.0);

    let full = orch.submit_merge(videos(3).with_preview_duration(5.0)).await.unwrap();
    assert_eq!(full.input_sources.len(), 3);
    assert_eq!(full.preview_duration_seconds, None);
}

#[tokio::test(start_paused = true)]
async fn test_download_before_completion_is_not_ready() {
    let runner = Arc::new(ScriptedRunner::new(vec![RunnerStatus::running(10.0)]));
    let orch = orchestrator(&runner);
    let job = orch.submit_merge(videos(2)).await.unwrap();

    match orch.download_result(job.id) {
        Err(JobError::NotReady { id, status }) => {
            assert_eq!(id, job.id);
            assert_eq!(status, JobState::Queued);
        }
        other => panic!("expected NotReady, got {other:?}"),
    }
    wait_until(&orch, job.id, JobState::Processing).await;
    assert!(matches!(
        orch.download_result(job.id),
        Err(JobError::NotReady { status: JobState::Processing, .. })
    ));
    assert!(matches!(
        orch.poll(MergeJobId::new()),
        Err(JobError::NotFound(_))
    ));
    orch.cancel(job.id).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transient_submission_errors_back_off() {
    let runner = Arc::new(
        ScriptedRunner::new(vec![RunnerStatus::succeeded("o.mp4")]).failing_enqueues(2),
    );
    let orch = orchestrator(&runner);
    let start = Instant::now();
    let job = orch.submit_merge(videos(1)).await.unwrap();
    let done = orch.wait(job.id).await.unwrap();
    assert_eq!(done.status, JobState::Completed);
    assert_eq!(done.retry_count, 0);
    // 250ms then 500ms of backoff before the third attempt
    assert!(start.elapsed() >= Duration::from_millis(750));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_runner_fails_then_retry_recovers() {
    let runner = Arc::new(
        ScriptedRunner::new(vec![RunnerStatus::succeeded("o.mp4")]).failing_enqueues(4),
    );
    let orch = orchestrator(&runner);
    let job = orch.submit_merge(videos(1)).await.unwrap();

    let failed = orch.wait(job.id).await.unwrap();
    assert_eq!(failed.status, JobState::Failed);
    assert_eq!(failed.failure, Some(FailureKind::RunnerUnavailable));
    assert!(failed.error_message.unwrap().contains("connection refused"));

    assert!(orch.retry(job.id).await.unwrap());
    let done = orch.wait(job.id).await.unwrap();
    assert_eq!(done.status, JobState::Completed);
    assert_eq!(done.retry_count, 1);
    assert!(done.error_message.is_none());

    assert!(matches!(
        orch.retry(job.id).await,
        Err(JobError::InvalidTransition {
            from: JobState::Completed,
            to: JobState::Queued
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_retry_is_capped() {
    let runner = Arc::new(ScriptedRunner::new(vec![
        RunnerStatus::running(30.0),
        RunnerStatus::failed("encoder crashed"),
    ]));
    let orch = orchestrator(&runner);
    let job = orch.submit_merge(videos(2)).await.unwrap();

    let failed = orch.wait(job.id).await.unwrap();
    assert_eq!(failed.failure, Some(FailureKind::Execution));
    assert_eq!(failed.error_message.as_deref(), Some("encoder crashed"));

    for expected in 1..=3 {
        assert!(orch.retry(job.id).await.unwrap());
        let again = orch.poll(job.id).unwrap();
        assert_eq!(again.status, JobState::Queued);
        assert_eq!(again.progress_percent, 0.0);
        let failed = orch.wait(job.id).await.unwrap();
        assert_eq!(failed.status, JobState::Failed);
        assert_eq!(failed.retry_count, expected);
    }
    assert!(!orch.retry(job.id).await.unwrap());
    let last = orch.poll(job.id).unwrap();
    assert_eq!(last.retry_count, 3);
    assert_eq!(last.status, JobState::Failed);

    let manifests = runner.manifests();
    assert_eq!(manifests.len(), 4);
    assert_eq!(
        manifests.iter().map(|m| m.attempt).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    assert!(manifests.iter().all(|m| m.inputs == manifests[0].inputs));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_beats_late_completion() {
    let gate = Arc::new(Semaphore::new(0));
    let runner = Arc::new(
        ScriptedRunner::new(vec![RunnerStatus::succeeded("late.mp4")]).gated(gate.clone()),
    );
    let orch = orchestrator(&runner);
    let job = orch.submit_merge(videos(1)).await.unwrap();

    // let the monitor reach its first (blocked) status call
    sleep(Duration::from_secs(1)).await;
    assert_eq!(orch.cancel(job.id).await.unwrap(), JobState::Cancelled);
    assert_eq!(runner.cancelled(), vec![RunnerJobId::new("run-1")]);

    gate.add_permits(10);
    sleep(Duration::from_secs(2)).await;
    let job = orch.poll(job.id).unwrap();
    assert_eq!(job.status, JobState::Cancelled);
    assert!(job.output_url.is_none());
    assert_eq!(orch.cancel(job.id).await.unwrap(), JobState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_completion_is_a_no_op() {
    let runner = Arc::new(ScriptedRunner::new(vec![RunnerStatus::succeeded("o.mp4")]));
    let orch = orchestrator(&runner);
    let job = orch.submit_merge(videos(1)).await.unwrap();
    orch.wait(job.id).await.unwrap();

    assert_eq!(orch.cancel(job.id).await.unwrap(), JobState::Completed);
    assert!(runner.cancelled().is_empty());
    assert_eq!(orch.download_result(job.id).unwrap(), "o.mp4");
}

#[tokio::test(start_paused = true)]
async fn test_stalled_job_fails_and_cancels_runner_job() {
    let runner = Arc::new(ScriptedRunner::new(vec![RunnerStatus::running(10.0)]));
    let orch = orchestrator_with(&runner, OrchestratorConfig::default().with_stall_timeout(5));
    let job = orch.submit_merge(videos(1)).await.unwrap();

    let failed = orch.wait(job.id).await.unwrap();
    assert_eq!(failed.status, JobState::Failed);
    assert_eq!(failed.failure, Some(FailureKind::Stalled));
    assert_eq!(failed.progress_percent, 10.0);
    assert_eq!(runner.cancelled(), vec![RunnerJobId::new("run-1")]);
}

#[tokio::test(start_paused = true)]
async fn test_status_errors_are_tolerated_up_to_a_limit() {
    let flaky = Arc::new(
        ScriptedRunner::new(vec![RunnerStatus::succeeded("o.mp4")]).failing_status(3),
    );
    let orch = orchestrator(&flaky);
    let job = orch.submit_merge(videos(1)).await.unwrap();
    assert_eq!(orch.wait(job.id).await.unwrap().status, JobState::Completed);

    let dead = Arc::new(
        ScriptedRunner::new(vec![RunnerStatus::succeeded("o.mp4")]).failing_status(u32::MAX),
    );
    let orch = orchestrator(&dead);
    let job = orch.submit_merge(videos(1)).await.unwrap();
    let lost = orch.wait(job.id).await.unwrap();
    assert_eq!(lost.status, JobState::Failed);
    assert_eq!(lost.failure, Some(FailureKind::Lost));
}

#[tokio::test(start_paused = true)]
async fn test_list_and_discard() {
    let runner = Arc::new(ScriptedRunner::new(vec![RunnerStatus::running(1.0)]));
    let orch = orchestrator(&runner);
    let chapter_id = ChapterId::new();
    let older = orch
        .submit_merge(MergeRequest::new(chapter_id, videos(1).input_sources))
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;
    let newer = orch
        .submit_preview(MergeRequest::new(chapter_id, videos(1).input_sources))
        .await
        .unwrap();
    orch.submit_merge(videos(1)).await.unwrap();

    let listed: Vec<MergeJobId> = orch.list_jobs(chapter_id).unwrap().iter().map(|j| j.id).collect();
    assert_eq!(listed.len(), 2);
    assert!(listed.contains(&older.id) && listed.contains(&newer.id));
    if newer.created_at > older.created_at {
        assert_eq!(listed[0], newer.id);
    }

    assert!(matches!(orch.discard(older.id), Err(JobError::StillActive(_))));
    orch.cancel(older.id).await.unwrap();
    orch.discard(older.id).unwrap();
    assert!(matches!(orch.poll(older.id), Err(JobError::NotFound(_))));
    assert_eq!(orch.list_jobs(chapter_id).unwrap().len(), 1);
    orch.cancel(newer.id).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_callback_subscriber_sees_terminal_event() {
    let runner = Arc::new(ScriptedRunner::new(vec![
        RunnerStatus::running(50.0),
        RunnerStatus::succeeded("o.mp4"),
    ]));
    let orch = orchestrator(&runner);
    let job = orch.submit_merge(videos(1)).await.unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();
    let sub = orch
        .subscribe_with(job.id, move |event| {
            let _ = tx.send(event.status);
        })
        .unwrap();
    orch.wait(job.id).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(status) = rx.recv_timeout(std::time::Duration::from_secs(2)) {
        seen.push(status);
        if status == JobState::Completed {
            break;
        }
    }
    assert_eq!(seen.last(), Some(&JobState::Completed));
    assert!(seen.contains(&JobState::Processing));
    assert!(orch.unsubscribe(sub));
}

#[tokio::test(start_paused = true)]
async fn test_restore_picks_up_persisted_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open(&dir.path().join("jobs.db")).unwrap());

    let first_runner = Arc::new(ScriptedRunner::new(vec![RunnerStatus::running(25.0)]));
    let first = MergeOrchestrator::new(first_runner.clone(), store.clone(), OrchestratorConfig::default());
    let job = first.submit_merge(videos(2)).await.unwrap();
    wait_until(&first, job.id, JobState::Processing).await;
    first.flush().unwrap();
    let persisted = store.load(job.id).unwrap().unwrap();
    assert_eq!(persisted.runner_job_id, Some(RunnerJobId::new("run-1")));

    // same runner job id, now reporting completion
    let second_runner = Arc::new(ScriptedRunner::new(vec![RunnerStatus::succeeded("o.mp4")]));
    second_runner
        .live
        .lock()
        .insert(RunnerJobId::new("run-1"), VecDeque::from(vec![RunnerStatus::succeeded("resumed.mp4")]));
    let second = MergeOrchestrator::new(second_runner.clone(), store.clone(), OrchestratorConfig::default());
    assert_eq!(second.restore().await.unwrap(), 1);
    assert_eq!(second.restore().await.unwrap(), 0);

    let done = second.wait(job.id).await.unwrap();
    assert_eq!(done.status, JobState::Completed);
    assert_eq!(done.output_url.as_deref(), Some("resumed.mp4"));
    assert!(second_runner.manifests().is_empty());
    second.flush().unwrap();
    assert_eq!(store.load(job.id).unwrap().unwrap().status, JobState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_finished_jobs_leave_memory() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open(&dir.path().join("jobs.db")).unwrap());
    let runner = Arc::new(ScriptedRunner::new(vec![RunnerStatus::succeeded("o.mp4")]));
    runner.scripts.lock().push_back(vec![RunnerStatus::failed("decoder crashed")]);
    let orch = MergeOrchestrator::new(runner.clone(), store.clone(), OrchestratorConfig::default());

    let failed = orch.submit_merge(videos(1)).await.unwrap();
    assert_eq!(orch.resident_jobs(), 1);
    assert_eq!(orch.wait(failed.id).await.unwrap().status, JobState::Failed);
    assert_eq!(orch.resident_jobs(), 0);

    // served from the store once evicted
    let polled = orch.poll(failed.id).unwrap();
    assert_eq!(polled.failure, Some(FailureKind::Execution));
    assert!(polled.revision > 0);
    assert_eq!(orch.list_jobs(failed.chapter_id).unwrap().len(), 1);

    // a retry brings it back until it finishes again
    assert!(orch.retry(failed.id).await.unwrap());
    assert_eq!(orch.resident_jobs(), 1);
    let done = orch.wait(failed.id).await.unwrap();
    assert_eq!(done.status, JobState::Completed);
    assert!(done.revision > polled.revision);
    assert_eq!(orch.resident_jobs(), 0);

    orch.flush().unwrap();
    let stored = store.load(failed.id).unwrap().unwrap();
    assert_eq!(stored.status, JobState::Completed);
    assert_eq!(stored.revision, done.revision);
}
