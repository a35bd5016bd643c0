use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use timeline::ChapterId;
use uuid::Uuid;

use crate::{EncodeSettings, JobError, OverrideParameters, Result, RunnerJobId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MergeJobId(pub Uuid);

impl MergeJobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MergeJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MergeJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MergeJobId {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| JobError::Validation(format!("invalid job id {s:?}: {e}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    Preview,
    FullMerge,
}

impl MergeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeKind::Preview => "preview",
            MergeKind::FullMerge => "full_merge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "preview" => Some(MergeKind::Preview),
            "full_merge" => Some(MergeKind::FullMerge),
            _ => None,
        }
    }
}

impl fmt::Display for MergeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Video,
    Audio,
}

/// One file feeding a merge, positioned on the output timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputSource {
    pub url: String,
    pub media_type: MediaType,
    #[serde(default)]
    pub start_time_seconds: f64,
    #[serde(default = "default_volume")]
    pub volume: f64,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

fn default_volume() -> f64 {
    1.0
}

impl InputSource {
    pub fn video(url: impl Into<String>, start_time_seconds: f64) -> Self {
        Self {
            url: url.into(),
            media_type: MediaType::Video,
            start_time_seconds,
            volume: default_volume(),
            duration_seconds: None,
        }
    }

    pub fn audio(url: impl Into<String>, start_time_seconds: f64, volume: f64) -> Self {
        Self {
            url: url.into(),
            media_type: MediaType::Audio,
            start_time_seconds,
            volume,
            duration_seconds: None,
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn is_video(&self) -> bool {
        self.media_type == MediaType::Video
    }

    pub fn end_time_seconds(&self) -> Option<f64> {
        self.duration_seconds.map(|d| self.start_time_seconds + d)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(JobError::Validation("input source url is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(JobError::Validation(format!(
                "volume {} for {} is outside 0.0..=1.0",
                self.volume, self.url
            )));
        }
        if !self.start_time_seconds.is_finite() || self.start_time_seconds < 0.0 {
            return Err(JobError::Validation(format!(
                "start time {} for {} must be zero or positive",
                self.start_time_seconds, self.url
            )));
        }
        if let Some(d) = self.duration_seconds {
            if !d.is_finite() || d <= 0.0 {
                return Err(JobError::Validation(format!(
                    "duration {d} for {} must be greater than zero",
                    self.url
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Web,
    #[default]
    Medium,
    High,
    Custom,
}

impl FromStr for QualityTier {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "web" => Ok(QualityTier::Web),
            "medium" => Ok(QualityTier::Medium),
            "high" => Ok(QualityTier::High),
            "custom" => Ok(QualityTier::Custom),
            other => Err(JobError::Validation(format!("unknown quality tier {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp4,
    WebM,
    Mov,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::WebM => "webm",
            OutputFormat::Mov => "mov",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mp4" => Ok(OutputFormat::Mp4),
            "webm" => Ok(OutputFormat::WebM),
            "mov" => Ok(OutputFormat::Mov),
            other => Err(JobError::Validation(format!("unknown output format {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "processing" => Some(JobState::Processing),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Edges of the job lifecycle. Self-edges on the two active states carry
    /// queue position and progress updates. `Failed -> Queued` is a retry.
    pub fn can_transition(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Queued)
                | (Queued, Processing)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended up `Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The runner could not be reached after all submission attempts.
    RunnerUnavailable,
    /// The runner refused the manifest.
    Rejected,
    /// The runner accepted the job and then reported an error.
    Execution,
    /// No progress was observed within the stall timeout.
    Stalled,
    /// The runner stopped answering status requests for the job.
    Lost,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::RunnerUnavailable => "runner unavailable",
            FailureKind::Rejected => "rejected",
            FailureKind::Execution => "execution error",
            FailureKind::Stalled => "stalled",
            FailureKind::Lost => "lost",
        };
        f.write_str(label)
    }
}

/// A merge or preview request and everything observed about it so far.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeJob {
    pub id: MergeJobId,
    pub chapter_id: ChapterId,
    pub kind: MergeKind,
    pub input_sources: Vec<InputSource>,
    pub quality_tier: QualityTier,
    pub output_format: OutputFormat,
    #[serde(default)]
    pub override_parameters: Option<OverrideParameters>,
    pub encode_settings: EncodeSettings,
    #[serde(default)]
    pub preview_duration_seconds: Option<f64>,
    pub status: JobState,
    #[serde(default)]
    pub progress_percent: f32,
    #[serde(default)]
    pub current_step_label: String,
    #[serde(default)]
    pub queue_position: Option<u32>,
    #[serde(default)]
    pub retry_count: u32,
    /// Bumped on every recorded change; orders progress events.
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub output_url: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub runner_job_id: Option<RunnerJobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MergeJob {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kind: MergeKind,
        chapter_id: ChapterId,
        input_sources: Vec<InputSource>,
        quality_tier: QualityTier,
        output_format: OutputFormat,
        override_parameters: Option<OverrideParameters>,
        encode_settings: EncodeSettings,
        preview_duration_seconds: Option<f64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: MergeJobId::new(),
            chapter_id,
            kind,
            input_sources,
            quality_tier,
            output_format,
            override_parameters,
            encode_settings,
            preview_duration_seconds,
            status: JobState::Queued,
            progress_percent: 0.0,
            current_step_label: "Queued".into(),
            queue_position: None,
            retry_count: 0,
            revision: 0,
            output_url: None,
            error_message: None,
            failure: None,
            runner_job_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn transition(&mut self, to: JobState) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Raises progress; never lowers it within an attempt. Returns whether
    /// anything observable changed.
    pub(crate) fn record_progress(&mut self, percent: f32, step: Option<&str>) -> bool {
        let mut changed = false;
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        if percent > self.progress_percent {
            self.progress_percent = percent;
            changed = true;
        }
        if let Some(step) = step.filter(|s| !s.is_empty()) {
            if step != self.current_step_label {
                self.current_step_label = step.to_string();
                changed = true;
            }
        }
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }

    pub(crate) fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> Result<()> {
        self.transition(JobState::Failed)?;
        self.failure = Some(kind);
        self.error_message = Some(message.into());
        self.queue_position = None;
        self.current_step_label = "Failed".into();
        Ok(())
    }

    /// Resets the attempt-scoped fields and moves a failed job back to the queue.
    pub(crate) fn requeue(&mut self) -> Result<()> {
        self.transition(JobState::Queued)?;
        self.retry_count += 1;
        self.progress_percent = 0.0;
        self.current_step_label = "Queued for retry".into();
        self.queue_position = None;
        self.output_url = None;
        self.error_message = None;
        self.failure = None;
        self.runner_job_id = None;
        Ok(())
    }
}
