use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{validate_duration, Result, DEFAULT_SHOT_DURATION_SECS};

/// Identity of a shot inside one chapter: the scene it belongs to and its
/// position among that scene's shots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShotId {
    /// 1-based narrative order.
    pub scene_number: u32,
    /// 0-based position within the scene.
    pub shot_index: u32,
}

impl ShotId {
    pub const fn new(scene_number: u32, shot_index: u32) -> Self {
        Self {
            scene_number,
            shot_index,
        }
    }
}

impl fmt::Display for ShotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scene {} shot {}", self.scene_number, self.shot_index)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShotType {
    KeyScene,
    SuggestedShot,
}

impl Default for ShotType {
    fn default() -> Self {
        Self::KeyScene
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Cut,
    Dissolve,
    Fade,
    Wipe,
    Slide,
    Custom(String),
}

impl Default for TransitionKind {
    fn default() -> Self {
        Self::Cut
    }
}

/// Applied at the boundary after the shot that carries it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    #[serde(default)]
    pub kind: TransitionKind,
    #[serde(default)]
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Shot {
    pub scene_number: u32,
    pub shot_index: u32,
    #[serde(default)]
    pub shot_type: ShotType,
    #[serde(default = "default_duration")]
    pub duration_seconds: f64,
    #[serde(default)]
    pub image_source: Option<String>,
    #[serde(default)]
    pub video_source: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub label: Option<String>,
}

fn default_duration() -> f64 {
    DEFAULT_SHOT_DURATION_SECS
}

impl Shot {
    pub fn new(scene_number: u32, shot_index: u32, shot_type: ShotType) -> Self {
        Self {
            scene_number,
            shot_index,
            shot_type,
            duration_seconds: DEFAULT_SHOT_DURATION_SECS,
            image_source: None,
            video_source: None,
            thumbnail: None,
            transitions: Vec::new(),
            label: None,
        }
    }

    pub fn with_image(mut self, image_source: impl Into<String>) -> Self {
        self.image_source = Some(image_source.into());
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = seconds;
        self
    }

    pub fn id(&self) -> ShotId {
        ShotId::new(self.scene_number, self.shot_index)
    }

    pub fn has_video(&self) -> bool {
        self.video_source
            .as_deref()
            .map_or(false, |url| !url.trim().is_empty())
    }

    pub(crate) fn sort_key(&self) -> (u32, u32) {
        (self.scene_number, self.shot_index)
    }
}

/// Editable fields of a shot. Identity and `video_source` are not editable
/// through a patch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ShotPatch {
    #[serde(default)]
    pub shot_type: Option<ShotType>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub image_source: Option<Option<String>>,
    #[serde(default)]
    pub thumbnail: Option<Option<String>>,
    #[serde(default)]
    pub transitions: Option<Vec<Transition>>,
    #[serde(default)]
    pub label: Option<Option<String>>,
}

impl ShotPatch {
    pub fn duration(seconds: f64) -> Self {
        Self {
            duration_seconds: Some(seconds),
            ..Self::default()
        }
    }

    /// Checks every present field without touching the shot.
    pub fn validate(&self) -> Result<()> {
        if let Some(seconds) = self.duration_seconds {
            validate_duration(seconds)?;
        }
        if let Some(transitions) = &self.transitions {
            for transition in transitions {
                if !(transition.duration_seconds.is_finite() && transition.duration_seconds >= 0.0)
                {
                    return Err(crate::TimelineError::Validation(format!(
                        "transition duration must be non-negative, got {}",
                        transition.duration_seconds
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn apply(self, shot: &mut Shot) {
        if let Some(shot_type) = self.shot_type {
            shot.shot_type = shot_type;
        }
        if let Some(seconds) = self.duration_seconds {
            shot.duration_seconds = seconds;
        }
        if let Some(image) = self.image_source {
            shot.image_source = image;
        }
        if let Some(thumbnail) = self.thumbnail {
            shot.thumbnail = thumbnail;
        }
        if let Some(transitions) = self.transitions {
            shot.transitions = transitions;
        }
        if let Some(label) = self.label {
            shot.label = label;
        }
    }
}
