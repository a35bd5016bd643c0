use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

mod shot;
pub use shot::*;
mod store;
pub use store::*;
mod audio;
pub use audio::*;
pub mod reconcile;
pub use reconcile::{
    classify, filter_for_shot, Classification, GeneratedClip, Generation, GenerationId,
    GenerationStatus, MatchRule, ReconcileReport, ShotAssignment,
};
mod chapter;
pub use chapter::*;

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("index {index} out of range for {len} shots")]
    InvalidRange { index: usize, len: usize },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("shot not found: {0}")]
    ShotNotFound(ShotId),
    #[error("shot already exists: {0}")]
    DuplicateShot(ShotId),
    #[error("audio clip not found: {0}")]
    ClipNotFound(ClipId),
    #[error("audio clip already exists: {0}")]
    DuplicateClip(ClipId),
    #[error("audio clip {0} is locked to its generated video and cannot be changed")]
    LockedClip(ClipId),
    #[error("generation not found: {0}")]
    GenerationNotFound(GenerationId),
}

pub type Result<T> = std::result::Result<T, TimelineError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ChapterId(pub Uuid);

impl ChapterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChapterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Seconds used for shots whose duration was never set.
pub const DEFAULT_SHOT_DURATION_SECS: f64 = 5.0;

pub(crate) fn validate_duration(seconds: f64) -> Result<()> {
    if seconds.is_finite() && seconds > 0.0 {
        Ok(())
    } else {
        Err(TimelineError::Validation(format!(
            "duration must be greater than zero, got {seconds}"
        )))
    }
}

pub(crate) fn validate_volume(volume: f64) -> Result<()> {
    if (0.0..=1.0).contains(&volume) {
        Ok(())
    } else {
        Err(TimelineError::Validation(format!(
            "volume must be within 0.0..=1.0, got {volume}"
        )))
    }
}
