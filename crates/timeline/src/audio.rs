use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{validate_volume, Result, ShotId, TimelineError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ClipId(pub String);

impl ClipId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AudioCategory {
    Narrator,
    Character,
    Music,
    Effects,
    Ambiance,
    Custom,
}

impl AudioCategory {
    /// Narration and dialogue are rendered into the generated video itself.
    pub fn is_baked_into_video(self) -> bool {
        matches!(self, Self::Narrator | Self::Character)
    }
}

impl fmt::Display for AudioCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Narrator => "narrator",
            Self::Character => "character",
            Self::Music => "music",
            Self::Effects => "effects",
            Self::Ambiance => "ambiance",
            Self::Custom => "custom",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioClip {
    pub id: ClipId,
    pub scene_number: u32,
    pub category: AudioCategory,
    pub duration_seconds: f64,
    #[serde(default = "default_volume")]
    pub volume: f64,
    pub source_url: String,
    #[serde(default)]
    pub text_content: Option<String>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub assigned_shot_index: Option<u32>,
    /// Position the generator gave the clip inside its scene.
    #[serde(default)]
    pub order_hint: Option<u32>,
    /// Delay from the start of the assigned shot.
    #[serde(default)]
    pub start_offset_seconds: f64,
}

fn default_volume() -> f64 {
    1.0
}

impl AudioClip {
    /// A user-added track. Never locked.
    pub fn new(
        id: impl Into<String>,
        scene_number: u32,
        category: AudioCategory,
        source_url: impl Into<String>,
        duration_seconds: f64,
    ) -> Self {
        Self {
            id: ClipId::new(id),
            scene_number,
            category,
            duration_seconds,
            volume: default_volume(),
            source_url: source_url.into(),
            text_content: None,
            locked: false,
            assigned_shot_index: None,
            order_hint: None,
            start_offset_seconds: 0.0,
        }
    }

    /// A clip produced alongside the video; narration and dialogue come out locked.
    pub fn generated(
        id: impl Into<String>,
        scene_number: u32,
        category: AudioCategory,
        source_url: impl Into<String>,
        duration_seconds: f64,
        order_hint: Option<u32>,
    ) -> Self {
        let mut clip = Self::new(id, scene_number, category, source_url, duration_seconds);
        clip.locked = category.is_baked_into_video();
        clip.order_hint = order_hint;
        clip
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text_content = Some(text.into());
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }

    pub fn assigned_to(mut self, shot_index: u32) -> Self {
        self.assigned_shot_index = Some(shot_index);
        self
    }

    /// Explicit assignment if present, else the generator's ordering hint, else the first shot.
    pub fn effective_shot_index(&self) -> u32 {
        self.assigned_shot_index.or(self.order_hint).unwrap_or(0)
    }

    pub fn effective_shot(&self) -> ShotId {
        ShotId::new(self.scene_number, self.effective_shot_index())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryEntry {
    clip: AudioClip,
    #[serde(default = "default_selected")]
    selected: bool,
}

fn default_selected() -> bool {
    true
}

/// All audio produced or added for one chapter. Insertion order is the
/// intrinsic order used to break ties.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioTrackRegistry {
    entries: Vec<RegistryEntry>,
}

impl AudioTrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add_clip(&mut self, clip: AudioClip) -> Result<()> {
        validate_volume(clip.volume)?;
        if !(clip.duration_seconds.is_finite() && clip.duration_seconds >= 0.0) {
            return Err(TimelineError::Validation(format!(
                "audio duration must be non-negative, got {}",
                clip.duration_seconds
            )));
        }
        if clip.scene_number == 0 {
            return Err(TimelineError::Validation(
                "scene numbers start at 1".to_string(),
            ));
        }
        if self.entries.iter().any(|e| e.clip.id == clip.id) {
            return Err(TimelineError::DuplicateClip(clip.id));
        }
        self.entries.push(RegistryEntry {
            clip,
            selected: true,
        });
        Ok(())
    }

    /// Deletes a user track. Generated narration and dialogue stay with their video.
    pub fn remove_clip(&mut self, id: &ClipId) -> Result<AudioClip> {
        let idx = self.index_of(id)?;
        if self.entries[idx].clip.locked {
            return Err(TimelineError::LockedClip(id.clone()));
        }
        Ok(self.entries.remove(idx).clip)
    }

    pub fn get(&self, id: &ClipId) -> Option<&AudioClip> {
        self.entries.iter().find(|e| &e.clip.id == id).map(|e| &e.clip)
    }

    pub fn clips(&self) -> impl Iterator<Item = &AudioClip> {
        self.entries.iter().map(|e| &e.clip)
    }

    pub fn tracks_for_scene(&self, scene_number: u32) -> Vec<&AudioClip> {
        let mut clips: Vec<(usize, &AudioClip)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.clip.scene_number == scene_number)
            .map(|(i, e)| (i, &e.clip))
            .collect();
        clips.sort_by_key(|(intrinsic, clip)| (clip.effective_shot_index(), *intrinsic));
        clips.into_iter().map(|(_, clip)| clip).collect()
    }

    pub fn tracks_for_shot(&self, scene_number: u32, shot_index: u32) -> Vec<&AudioClip> {
        self.tracks_for_scene(scene_number)
            .into_iter()
            .filter(|clip| clip.effective_shot_index() == shot_index)
            .collect()
    }

    pub fn assign(&mut self, id: &ClipId, scene_number: u32, shot_index: u32) -> Result<()> {
        if scene_number == 0 {
            return Err(TimelineError::Validation(
                "scene numbers start at 1".to_string(),
            ));
        }
        let clip = self.unlocked_mut(id)?;
        clip.scene_number = scene_number;
        clip.assigned_shot_index = Some(shot_index);
        Ok(())
    }

    /// Drops an explicit assignment so the clip falls back to its default shot.
    pub fn clear_assignment(&mut self, id: &ClipId) -> Result<()> {
        self.unlocked_mut(id)?.assigned_shot_index = None;
        Ok(())
    }

    pub fn set_volume(&mut self, id: &ClipId, volume: f64) -> Result<()> {
        validate_volume(volume)?;
        let idx = self.index_of(id)?;
        self.entries[idx].clip.volume = volume;
        Ok(())
    }

    pub fn set_start_offset(&mut self, id: &ClipId, seconds: f64) -> Result<()> {
        if !(seconds.is_finite() && seconds >= 0.0) {
            return Err(TimelineError::Validation(format!(
                "start offset must be non-negative, got {seconds}"
            )));
        }
        self.unlocked_mut(id)?.start_offset_seconds = seconds;
        Ok(())
    }

    /// Flips whether an unlocked clip goes into the next merge. Returns the new state.
    pub fn toggle_selection(&mut self, id: &ClipId) -> Result<bool> {
        let idx = self.index_of(id)?;
        let entry = &mut self.entries[idx];
        if entry.clip.locked {
            return Err(TimelineError::LockedClip(id.clone()));
        }
        entry.selected = !entry.selected;
        Ok(entry.selected)
    }

    pub fn is_selected(&self, id: &ClipId) -> Result<bool> {
        let idx = self.index_of(id)?;
        let entry = &self.entries[idx];
        Ok(entry.clip.locked || entry.selected)
    }

    /// Locked clips plus selected unlocked clips, by scene, shot and intrinsic order.
    pub fn merge_selection(&self) -> Vec<&AudioClip> {
        let mut clips: Vec<(usize, &AudioClip)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.clip.locked || e.selected)
            .map(|(i, e)| (i, &e.clip))
            .collect();
        clips.sort_by_key(|(intrinsic, clip)| {
            (clip.scene_number, clip.effective_shot_index(), *intrinsic)
        });
        clips.into_iter().map(|(_, clip)| clip).collect()
    }

    fn index_of(&self, id: &ClipId) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| &e.clip.id == id)
            .ok_or_else(|| TimelineError::ClipNotFound(id.clone()))
    }

    fn unlocked_mut(&mut self, id: &ClipId) -> Result<&mut AudioClip> {
        let idx = self.index_of(id)?;
        let clip = &mut self.entries[idx].clip;
        if clip.locked {
            return Err(TimelineError::LockedClip(id.clone()));
        }
        Ok(clip)
    }
}
