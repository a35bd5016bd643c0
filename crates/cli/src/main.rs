use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use jobs::{
    FfmpegRunner, JobState, ManifestBuilder, MergeConfig, MergeJob, MergeJobId,
    MergeOrchestrator, MergeRequest, OutputFormat, OverrideParameters, QualityTier,
    SqliteJobStore,
};
use project::ProjectDb;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use timeline::{Chapter, ChapterId, GenerationId, ShotId};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "chapter-merge")]
#[command(about = "Assemble chapter timelines and drive preview and merge renders")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON config file (orchestrator and ffmpeg settings)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database holding chapters and merge jobs
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a chapter JSON document in the database
    Import {
        /// Chapter JSON file
        file: PathBuf,
    },

    /// List the chapters stored in the database
    Chapters,

    /// Delete a stored chapter together with its merge job history
    Remove {
        /// Chapter id
        chapter: String,
    },

    /// Render the full chapter
    Merge {
        #[command(flatten)]
        render: RenderArgs,
    },

    /// Render a short preview of the first inputs
    Preview {
        #[command(flatten)]
        render: RenderArgs,

        /// Preview length in seconds
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Show a merge job
    Status {
        job: String,
    },

    /// List every merge job recorded for a chapter
    Jobs {
        /// Chapter JSON file or chapter id
        chapter: String,
    },

    /// Retry a failed merge job and wait for it
    Retry {
        job: String,
    },

    /// Cancel a queued or running merge job
    Cancel {
        job: String,
    },

    /// Split a chapter's generations into playable and failed
    Classify {
        /// Chapter JSON file or chapter id
        chapter: String,

        /// Drop every failed generation and save the chapter
        #[arg(long)]
        discard_failed: bool,
    },

    /// Match a generation's clips to shots and record the videos
    Reconcile {
        /// Chapter JSON file or chapter id
        chapter: String,

        #[arg(short, long)]
        generation: String,

        /// Only print the report
        #[arg(long)]
        dry_run: bool,
    },

    /// Move a shot to another position in the timeline
    Reorder {
        /// Chapter JSON file or chapter id
        chapter: String,

        #[arg(long)]
        from: usize,

        #[arg(long)]
        to: usize,
    },
}

#[derive(Args)]
struct RenderArgs {
    /// Chapter JSON file or chapter id
    chapter: String,

    /// web, medium, high or custom
    #[arg(short, long, default_value = "medium")]
    quality: String,

    /// mp4, webm or mov
    #[arg(short, long, default_value = "mp4")]
    format: String,

    /// Only render these shots, as SCENE:INDEX
    #[arg(long, value_delimiter = ',')]
    shots: Vec<String>,

    /// Leave out all audio tracks
    #[arg(long)]
    no_audio: bool,

    /// WIDTHxHEIGHT
    #[arg(long)]
    resolution: Option<String>,

    #[arg(long)]
    fps: Option<u32>,

    #[arg(long)]
    crf: Option<u8>,

    #[arg(long)]
    preset: Option<String>,

    #[arg(long)]
    video_codec: Option<String>,

    #[arg(long)]
    audio_codec: Option<String>,

    /// Submit and return without waiting
    #[arg(long)]
    detach: bool,
}

impl RenderArgs {
    fn overrides(&self) -> Option<OverrideParameters> {
        let overrides = OverrideParameters {
            video_codec: self.video_codec.clone(),
            audio_codec: self.audio_codec.clone(),
            resolution: self.resolution.clone(),
            fps: self.fps,
            preset: self.preset.clone(),
            crf: self.crf,
        };
        (!overrides.is_empty()).then_some(overrides)
    }

    fn request(&self, chapter: &Chapter) -> Result<MergeRequest> {
        let mut builder = ManifestBuilder::for_chapter(chapter);
        if !self.shots.is_empty() {
            let shots = self
                .shots
                .iter()
                .map(|s| parse_shot_id(s))
                .collect::<Result<Vec<_>>>()?;
            builder = builder.only_shots(shots);
        }
        if self.no_audio {
            builder = builder.without_audio();
        }
        let mut request = MergeRequest::new(chapter.id, builder.build())
            .with_quality(self.quality.parse::<QualityTier>()?)
            .with_format(self.format.parse::<OutputFormat>()?);
        if let Some(overrides) = self.overrides() {
            request = request.with_overrides(overrides);
        }
        Ok(request)
    }
}

/// Where a chapter was read from, so edits go back to the same place.
enum ChapterSource {
    File(PathBuf),
    Database(ChapterId),
}

struct Workspace {
    config: MergeConfig,
    db_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => MergeConfig::load(path)?,
        None => MergeConfig::default(),
    };
    let db_path = cli.db.clone().unwrap_or_else(project::default_db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let ctx = Workspace { config, db_path };

    match cli.command {
        Commands::Import { file } => import_command(&ctx, &file),
        Commands::Chapters => chapters_command(&ctx),
        Commands::Remove { chapter } => remove_command(&ctx, &chapter),
        Commands::Merge { render } => render_command(&ctx, render, None, false).await,
        Commands::Preview { render, duration } => {
            render_command(&ctx, render, duration, true).await
        }
        Commands::Status { job } => status_command(&ctx, &job),
        Commands::Jobs { chapter } => jobs_command(&ctx, &chapter),
        Commands::Retry { job } => retry_command(&ctx, &job).await,
        Commands::Cancel { job } => cancel_command(&ctx, &job).await,
        Commands::Classify {
            chapter,
            discard_failed,
        } => classify_command(&ctx, &chapter, discard_failed),
        Commands::Reconcile {
            chapter,
            generation,
            dry_run,
        } => reconcile_command(&ctx, &chapter, &generation, dry_run),
        Commands::Reorder { chapter, from, to } => reorder_command(&ctx, &chapter, from, to),
    }
}

fn open_db(ctx: &Workspace) -> Result<ProjectDb> {
    ProjectDb::open_or_create(&ctx.db_path)
        .with_context(|| format!("opening {}", ctx.db_path.display()))
}

fn orchestrator(ctx: &Workspace) -> Result<MergeOrchestrator> {
    let store = SqliteJobStore::open(&ctx.db_path)?;
    let runner = FfmpegRunner::new(ctx.config.ffmpeg.clone());
    Ok(MergeOrchestrator::new(
        Arc::new(runner),
        Arc::new(store),
        ctx.config.orchestrator.clone(),
    ))
}

fn parse_shot_id(s: &str) -> Result<ShotId> {
    let (scene, index) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("shot {s:?} is not SCENE:INDEX"))?;
    Ok(ShotId::new(
        scene.trim().parse().with_context(|| format!("scene in {s:?}"))?,
        index.trim().parse().with_context(|| format!("shot index in {s:?}"))?,
    ))
}

fn parse_job_id(s: &str) -> Result<MergeJobId> {
    Ok(s.parse::<MergeJobId>()?)
}

fn load_chapter(ctx: &Workspace, arg: &str) -> Result<(Chapter, ChapterSource)> {
    let path = Path::new(arg);
    if path.exists() {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let chapter = Chapter::from_json(&json)
            .with_context(|| format!("parsing chapter {}", path.display()))?;
        return Ok((chapter, ChapterSource::File(path.to_path_buf())));
    }
    let id = Uuid::parse_str(arg)
        .map(ChapterId)
        .map_err(|_| anyhow!("{arg:?} is neither a chapter file nor a chapter id"))?;
    let json = open_db(ctx)?
        .get_chapter_json(&id.to_string())?
        .ok_or_else(|| anyhow!("chapter {id} is not in the database"))?;
    let chapter = Chapter::from_json(&json).with_context(|| format!("parsing chapter {id}"))?;
    Ok((chapter, ChapterSource::Database(id)))
}

fn save_chapter(ctx: &Workspace, chapter: &Chapter, source: &ChapterSource) -> Result<()> {
    let json = chapter.to_json()?;
    match source {
        ChapterSource::File(path) => std::fs::write(path, json)
            .with_context(|| format!("writing {}", path.display()))?,
        ChapterSource::Database(_) => {
            open_db(ctx)?.upsert_chapter(&chapter.id.to_string(), &chapter.title, &json)?
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn import_command(ctx: &Workspace, file: &Path) -> Result<()> {
    let (chapter, _) = load_chapter(ctx, &file.to_string_lossy())?;
    let db = open_db(ctx)?;
    db.upsert_chapter(&chapter.id.to_string(), &chapter.title, &chapter.to_json()?)?;
    info!(
        chapter = %chapter.id,
        shots = chapter.list_shots().len(),
        audio = chapter.audio.len(),
        "imported chapter"
    );
    println!("{}", chapter.id);
    Ok(())
}

fn chapters_command(ctx: &Workspace) -> Result<()> {
    for row in open_db(ctx)?.list_chapters()? {
        let updated = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(row.updated_at)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!("{}  {:<32} {}", row.id, row.title, updated);
    }
    Ok(())
}

fn remove_command(ctx: &Workspace, chapter: &str) -> Result<()> {
    let id = Uuid::parse_str(chapter).with_context(|| format!("{chapter:?} is not a chapter id"))?;
    if !open_db(ctx)?.delete_chapter(&id.to_string())? {
        bail!("chapter {id} is not in the database");
    }
    info!(chapter = %id, "removed chapter and its merge jobs");
    Ok(())
}

async fn render_command(
    ctx: &Workspace,
    args: RenderArgs,
    preview_duration: Option<f64>,
    preview: bool,
) -> Result<()> {
    let (chapter, _) = load_chapter(ctx, &args.chapter)?;
    open_db(ctx)?.upsert_chapter(&chapter.id.to_string(), &chapter.title, &chapter.to_json()?)?;

    let mut request = args.request(&chapter)?;
    if let Some(seconds) = preview_duration {
        request = request.with_preview_duration(seconds);
    }
    let orch = orchestrator(ctx)?;
    let job = if preview {
        orch.submit_preview(request).await?
    } else {
        orch.submit_merge(request).await?
    };
    info!(job = %job.id, kind = %job.kind, inputs = job.input_sources.len(), "submitted");
    if args.detach {
        orch.flush()?;
        println!("{}", job.id);
        return Ok(());
    }
    follow(&orch, job.id).await
}

/// Logs progress events until the job finishes, then reports the outcome.
async fn follow(orch: &MergeOrchestrator, id: MergeJobId) -> Result<()> {
    let subscription = orch.subscribe_with(id, |event| {
        info!(
            status = %event.status,
            progress = %format!("{:.1}%", event.progress_percent),
            step = %event.step_label,
            "{}",
            event.job_id
        );
    })?;
    let job = orch.wait(id).await?;
    orch.unsubscribe(subscription);
    orch.flush()?;
    report(&job)
}

fn report(job: &MergeJob) -> Result<()> {
    match job.status {
        JobState::Completed => {
            println!("{}", job.output_url.as_deref().unwrap_or_default());
            Ok(())
        }
        JobState::Cancelled => bail!("merge job {} was cancelled", job.id),
        _ => bail!(
            "merge job {} failed ({}): {}",
            job.id,
            job.failure.map(|f| f.to_string()).unwrap_or_default(),
            job.error_message.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn status_command(ctx: &Workspace, job: &str) -> Result<()> {
    let job = orchestrator(ctx)?.poll(parse_job_id(job)?)?;
    print_json(&job)
}

fn jobs_command(ctx: &Workspace, chapter: &str) -> Result<()> {
    let chapter_id = match Uuid::parse_str(chapter) {
        Ok(id) => ChapterId(id),
        Err(_) => load_chapter(ctx, chapter)?.0.id,
    };
    let jobs = orchestrator(ctx)?.list_jobs(chapter_id)?;
    if jobs.is_empty() {
        info!(chapter = %chapter_id, "no merge jobs recorded");
    }
    for job in jobs {
        println!(
            "{}  {:<10} {:<10} {:>5.1}%  retries={}  {}",
            job.id,
            job.kind,
            job.status,
            job.progress_percent,
            job.retry_count,
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn retry_command(ctx: &Workspace, job: &str) -> Result<()> {
    let id = parse_job_id(job)?;
    let orch = orchestrator(ctx)?;
    if !orch.retry(id).await? {
        bail!("merge job {id} has used all its retries");
    }
    follow(&orch, id).await
}

async fn cancel_command(ctx: &Workspace, job: &str) -> Result<()> {
    let id = parse_job_id(job)?;
    let orch = orchestrator(ctx)?;
    let state = orch.cancel(id).await?;
    orch.flush()?;
    if state != JobState::Cancelled {
        warn!(job = %id, status = %state, "job had already finished");
    }
    println!("{state}");
    Ok(())
}

fn classify_command(ctx: &Workspace, chapter: &str, discard_failed: bool) -> Result<()> {
    let (mut chapter, source) = load_chapter(ctx, chapter)?;
    let classification = chapter.classify();
    for generation in &classification.playable {
        println!("playable  {}  clips={}", generation.id, generation.usable_clips().count());
    }
    for generation in &classification.failed {
        println!(
            "failed    {}  {}",
            generation.id,
            generation.error_message.as_deref().unwrap_or("no usable clips")
        );
    }
    if discard_failed {
        let removed = chapter.discard_failed_generations();
        save_chapter(ctx, &chapter, &source)?;
        info!(removed, "discarded failed generations");
    }
    Ok(())
}

fn reconcile_command(
    ctx: &Workspace,
    chapter: &str,
    generation: &str,
    dry_run: bool,
) -> Result<()> {
    let (mut chapter, source) = load_chapter(ctx, chapter)?;
    let generation = GenerationId::new(generation);
    let report = if dry_run {
        let found = chapter
            .generation(&generation)
            .ok_or_else(|| anyhow!("generation {generation} not found"))?;
        timeline::reconcile::reconcile(found, chapter.list_shots())
    } else {
        let report = chapter.apply_generation(&generation)?;
        save_chapter(ctx, &chapter, &source)?;
        report
    };
    for assignment in &report.assignments {
        println!(
            "{}  <- {}  ({:?})",
            assignment.shot, assignment.video_url, assignment.rule
        );
    }
    for url in &report.unassociated {
        println!("unassociated  {url}");
    }
    Ok(())
}

fn reorder_command(ctx: &Workspace, chapter: &str, from: usize, to: usize) -> Result<()> {
    let (mut chapter, source) = load_chapter(ctx, chapter)?;
    chapter.reorder(from, to)?;
    save_chapter(ctx, &chapter, &source)?;
    for shot in chapter.list_shots() {
        println!("{}  {:.1}s  {}", shot.id(), shot.duration_seconds, shot.video_source.as_deref().unwrap_or("-"));
    }
    Ok(())
}
