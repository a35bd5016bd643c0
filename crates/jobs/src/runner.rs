use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::JobManifest;

/// Identifier a runner hands back for an accepted manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RunnerJobId(pub String);

impl RunnerJobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunnerJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Queued {
        #[serde(default)]
        position: Option<u32>,
    },
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunnerState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// One status report from the runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerStatus {
    pub state: RunnerState,
    /// 0..=100.
    #[serde(default)]
    pub progress: f32,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub output_ref: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunnerStatus {
    pub fn queued(position: Option<u32>) -> Self {
        Self::with_state(RunnerState::Queued { position })
    }

    pub fn running(progress: f32) -> Self {
        Self {
            progress,
            ..Self::with_state(RunnerState::Running)
        }
    }

    pub fn succeeded(output_ref: impl Into<String>) -> Self {
        Self {
            progress: 100.0,
            output_ref: Some(output_ref.into()),
            ..Self::with_state(RunnerState::Succeeded)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_state(RunnerState::Failed)
        }
    }

    pub fn cancelled() -> Self {
        Self::with_state(RunnerState::Cancelled)
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    fn with_state(state: RunnerState) -> Self {
        Self {
            state,
            progress: 0.0,
            step: None,
            output_ref: None,
            error: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner unavailable: {0}")]
    Unavailable(String),
    #[error("runner rejected the job: {0}")]
    Rejected(String),
    #[error("runner does not know job {0}")]
    UnknownJob(RunnerJobId),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Whether trying the same call again later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RunnerError::Unavailable(_))
    }
}

/// The external worker that actually renders a manifest.
#[async_trait]
pub trait JobRunner: Send + Sync {
    fn name(&self) -> &str;

    async fn enqueue(&self, manifest: &JobManifest) -> Result<RunnerJobId, RunnerError>;

    async fn status(&self, id: &RunnerJobId) -> Result<RunnerStatus, RunnerError>;

    async fn cancel(&self, id: &RunnerJobId) -> Result<(), RunnerError>;
}
