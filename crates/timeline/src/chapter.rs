use serde::{Deserialize, Serialize};
use tracing::info;

use crate::reconcile::{self, Classification, ReconcileReport};
use crate::{
    AudioClip, AudioTrackRegistry, ChapterId, Generation, GenerationId, Result, Shot, ShotId,
    ShotPatch, TimelineError, TimelineStore,
};

/// Everything one chapter's editor session works on: shots, audio and the
/// generation batches that arrived for it. Built per request or per session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub timeline: TimelineStore,
    #[serde(default)]
    pub audio: AudioTrackRegistry,
    #[serde(default)]
    pub generations: Vec<Generation>,
}

impl Chapter {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: ChapterId::new(),
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn list_shots(&self) -> &[Shot] {
        self.timeline.list_shots()
    }

    pub fn shot(&self, id: ShotId) -> Result<&Shot> {
        self.timeline.get(id).ok_or(TimelineError::ShotNotFound(id))
    }

    pub fn reorder(&mut self, from: usize, to: usize) -> Result<()> {
        self.timeline.reorder(from, to)
    }

    pub fn update_shot(&mut self, id: ShotId, patch: ShotPatch) -> Result<()> {
        self.timeline.update_shot(id, patch)
    }

    pub fn tracks_for_shot(&self, id: ShotId) -> Vec<&AudioClip> {
        self.audio.tracks_for_shot(id.scene_number, id.shot_index)
    }

    pub fn add_generation(&mut self, generation: Generation) {
        if let Some(existing) = self.generations.iter_mut().find(|g| g.id == generation.id) {
            *existing = generation;
        } else {
            self.generations.push(generation);
        }
    }

    pub fn generation(&self, id: &GenerationId) -> Option<&Generation> {
        self.generations.iter().find(|g| &g.id == id)
    }

    pub fn discard_generation(&mut self, id: &GenerationId) -> Result<Generation> {
        let idx = self
            .generations
            .iter()
            .position(|g| &g.id == id)
            .ok_or_else(|| TimelineError::GenerationNotFound(id.clone()))?;
        Ok(self.generations.remove(idx))
    }

    /// Drops every generation that has nothing to play. Returns how many went.
    pub fn discard_failed_generations(&mut self) -> usize {
        let before = self.generations.len();
        self.generations.retain(Generation::is_playable);
        before - self.generations.len()
    }

    pub fn classify(&self) -> Classification<'_> {
        reconcile::classify(&self.generations)
    }

    pub fn filter_for_shot(&self, id: ShotId) -> Result<Vec<&Generation>> {
        let shot = self.shot(id)?;
        Ok(reconcile::filter_for_shot(&self.generations, shot))
    }

    /// Matches a stored generation against the current shots and records the
    /// winning clip on each matched shot.
    pub fn apply_generation(&mut self, id: &GenerationId) -> Result<ReconcileReport> {
        let generation = self
            .generation(id)
            .ok_or_else(|| TimelineError::GenerationNotFound(id.clone()))?;
        let report = reconcile::reconcile(generation, self.timeline.list_shots());
        let mut updated = 0usize;
        for assignment in &report.assignments {
            if self
                .timeline
                .set_video_source(assignment.shot, &assignment.video_url)?
            {
                updated += 1;
            }
        }
        info!(
            chapter = %self.id,
            generation = %id,
            matched = report.assignments.len(),
            updated,
            unassociated = report.unassociated.len(),
            "reconciled generation"
        );
        Ok(report)
    }
}
