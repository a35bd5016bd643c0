//! Merge and preview job orchestration for chapter timelines.
//!
//! [`MergeOrchestrator`] validates a [`MergeRequest`], hands the resulting
//! [`JobManifest`] to a [`JobRunner`], and owns the job's state machine while
//! the runner works. Every accepted transition is persisted to a [`JobStore`]
//! and published on the [`ProgressChannel`].

use thiserror::Error;

mod job;
pub use job::*;
mod settings;
pub use settings::*;
mod manifest;
pub use manifest::*;
mod runner;
pub use runner::*;
pub mod ffmpeg;
pub use ffmpeg::{FfmpegRunner, FfmpegRunnerConfig};
mod progress;
pub use progress::*;
mod store;
pub use store::*;
mod config;
pub use config::*;
mod orchestrator;
pub use orchestrator::*;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("merge request has no input sources")]
    EmptyInput,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("merge job not found: {0}")]
    NotFound(MergeJobId),
    #[error("merge job {id} is not ready (status: {status})")]
    NotReady { id: MergeJobId, status: JobState },
    #[error("invalid job transition {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },
    #[error("merge job {0} is still active")]
    StillActive(MergeJobId),
    #[error("job store error: {0}")]
    Store(String),
    #[error(transparent)]
    Timeline(#[from] timeline::TimelineError),
}

pub type Result<T> = std::result::Result<T, JobError>;
