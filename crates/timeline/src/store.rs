use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{validate_duration, Result, Shot, ShotId, ShotPatch, ShotType, TimelineError};

/// Ordered shots of one chapter, always sorted by (`scene_number`, `shot_index`).
///
/// Deserialization goes through the same validation as [`TimelineStore::from_shots`],
/// so a stored timeline with duplicated identities is rejected on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "Vec<Shot>", into = "Vec<Shot>")]
pub struct TimelineStore {
    shots: Vec<Shot>,
}

impl TryFrom<Vec<Shot>> for TimelineStore {
    type Error = TimelineError;

    fn try_from(shots: Vec<Shot>) -> Result<Self> {
        Self::from_shots(shots)
    }
}

impl From<TimelineStore> for Vec<Shot> {
    fn from(store: TimelineStore) -> Self {
        store.shots
    }
}

impl TimelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_shots(mut shots: Vec<Shot>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(shots.len());
        for shot in &shots {
            if shot.scene_number == 0 {
                return Err(TimelineError::Validation(format!(
                    "scene numbers start at 1 ({})",
                    shot.id()
                )));
            }
            validate_duration(shot.duration_seconds)?;
            if !seen.insert(shot.id()) {
                return Err(TimelineError::DuplicateShot(shot.id()));
            }
        }
        shots.sort_by_key(Shot::sort_key);
        Ok(Self { shots })
    }

    pub fn list_shots(&self) -> &[Shot] {
        &self.shots
    }

    pub fn len(&self) -> usize {
        self.shots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shots.is_empty()
    }

    pub fn get(&self, id: ShotId) -> Option<&Shot> {
        self.position(id).map(|idx| &self.shots[idx])
    }

    pub fn position(&self, id: ShotId) -> Option<usize> {
        self.shots
            .binary_search_by_key(&(id.scene_number, id.shot_index), Shot::sort_key)
            .ok()
    }

    pub fn shots_in_scene(&self, scene_number: u32) -> impl Iterator<Item = &Shot> {
        self.shots
            .iter()
            .filter(move |shot| shot.scene_number == scene_number)
    }

    pub fn scene_numbers(&self) -> Vec<u32> {
        let mut scenes: Vec<u32> = self.shots.iter().map(|s| s.scene_number).collect();
        scenes.dedup();
        scenes
    }

    /// Appends a shot at the end of `scene_number` and returns its identity.
    pub fn insert_shot(
        &mut self,
        scene_number: u32,
        shot_type: ShotType,
        image_source: Option<String>,
        duration_seconds: Option<f64>,
    ) -> Result<ShotId> {
        if scene_number == 0 {
            return Err(TimelineError::Validation(
                "scene numbers start at 1".to_string(),
            ));
        }
        let mut shot = Shot::new(scene_number, 0, shot_type);
        if let Some(seconds) = duration_seconds {
            validate_duration(seconds)?;
            shot.duration_seconds = seconds;
        }
        shot.image_source = image_source;
        shot.shot_index = self
            .shots_in_scene(scene_number)
            .map(|s| s.shot_index + 1)
            .max()
            .unwrap_or(0);
        let id = shot.id();
        let at = self
            .shots
            .partition_point(|s| s.sort_key() < (id.scene_number, id.shot_index));
        self.shots.insert(at, shot);
        Ok(id)
    }

    /// Removes a shot (excluded from the storyboard); its later siblings move up by one.
    pub fn remove_shot(&mut self, id: ShotId) -> Result<Shot> {
        let idx = self.position(id).ok_or(TimelineError::ShotNotFound(id))?;
        let removed = self.shots.remove(idx);
        self.renumber_scene(removed.scene_number);
        Ok(removed)
    }

    /// Moves the shot at global position `from` to global position `to`.
    ///
    /// The moved shot takes the slot of the shot currently at `to`, adopting
    /// its scene. The source and destination scenes are renumbered in one step.
    pub fn reorder(&mut self, from: usize, to: usize) -> Result<()> {
        let len = self.shots.len();
        if from >= len {
            return Err(TimelineError::InvalidRange { index: from, len });
        }
        if to >= len {
            return Err(TimelineError::InvalidRange { index: to, len });
        }
        if from == to {
            return Ok(());
        }

        let source_scene = self.shots[from].scene_number;
        let target_scene = self.shots[to].scene_number;
        let mut moved = self.shots.remove(from);
        moved.scene_number = target_scene;
        self.shots.insert(to, moved);

        self.renumber_scene(source_scene);
        if target_scene != source_scene {
            self.renumber_scene(target_scene);
        }
        Ok(())
    }

    /// Identity-addressed variant of [`reorder`](Self::reorder). Returns the
    /// shot's identity after the move; repeating the call is a no-op.
    pub fn move_shot(&mut self, id: ShotId, to: usize) -> Result<ShotId> {
        let from = self.position(id).ok_or(TimelineError::ShotNotFound(id))?;
        self.reorder(from, to)?;
        Ok(self.shots[to].id())
    }

    pub fn update_shot(&mut self, id: ShotId, patch: ShotPatch) -> Result<()> {
        patch.validate()?;
        let idx = self.position(id).ok_or(TimelineError::ShotNotFound(id))?;
        patch.apply(&mut self.shots[idx]);
        Ok(())
    }

    /// Records the produced clip for a shot. Returns `false` when the shot
    /// already pointed at `video_url`.
    pub fn set_video_source(&mut self, id: ShotId, video_url: &str) -> Result<bool> {
        if video_url.trim().is_empty() {
            return Err(TimelineError::Validation(
                "video source must not be empty".to_string(),
            ));
        }
        let idx = self.position(id).ok_or(TimelineError::ShotNotFound(id))?;
        let shot = &mut self.shots[idx];
        if shot.video_source.as_deref() == Some(video_url) {
            return Ok(false);
        }
        shot.video_source = Some(video_url.to_string());
        Ok(true)
    }

    pub fn clear_video_source(&mut self, id: ShotId) -> Result<Option<String>> {
        let idx = self.position(id).ok_or(TimelineError::ShotNotFound(id))?;
        Ok(self.shots[idx].video_source.take())
    }

    /// Start of the shot on the rendered timeline, in seconds.
    pub fn start_time_of(&self, id: ShotId) -> Option<f64> {
        let idx = self.position(id)?;
        Some(self.shots[..idx].iter().map(|s| s.duration_seconds).sum())
    }

    pub fn total_duration(&self) -> f64 {
        self.shots.iter().map(|s| s.duration_seconds).sum()
    }

    fn renumber_scene(&mut self, scene_number: u32) {
        let mut next = 0;
        for shot in self
            .shots
            .iter_mut()
            .filter(|shot| shot.scene_number == scene_number)
        {
            shot.shot_index = next;
            next += 1;
        }
    }
}
