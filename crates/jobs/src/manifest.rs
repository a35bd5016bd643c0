use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use timeline::{Chapter, ChapterId, ShotId};
use tracing::debug;

use crate::{
    EncodeSettings, InputSource, JobError, MergeJob, MergeJobId, MergeKind, OutputFormat,
    OverrideParameters, QualityTier, Result,
};

/// Previews render at most this many inputs.
pub const MAX_PREVIEW_INPUTS: usize = 2;

/// What a caller asks to have merged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeRequest {
    pub chapter_id: ChapterId,
    pub input_sources: Vec<InputSource>,
    #[serde(default)]
    pub quality_tier: QualityTier,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub override_parameters: Option<OverrideParameters>,
    /// Only read for previews.
    #[serde(default)]
    pub preview_duration_seconds: Option<f64>,
}

impl MergeRequest {
    pub fn new(chapter_id: ChapterId, input_sources: Vec<InputSource>) -> Self {
        Self {
            chapter_id,
            input_sources,
            quality_tier: QualityTier::default(),
            output_format: OutputFormat::default(),
            override_parameters: None,
            preview_duration_seconds: None,
        }
    }

    /// Every rendered shot plus the chapter's locked and selected audio.
    pub fn for_chapter(chapter: &Chapter) -> Self {
        Self::new(chapter.id, ManifestBuilder::for_chapter(chapter).build())
    }

    pub fn with_quality(mut self, tier: QualityTier) -> Self {
        self.quality_tier = tier;
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_overrides(mut self, overrides: OverrideParameters) -> Self {
        self.override_parameters = Some(overrides);
        self
    }

    pub fn with_preview_duration(mut self, seconds: f64) -> Self {
        self.preview_duration_seconds = Some(seconds);
        self
    }

    /// Checks inputs and encoder parameters, returning the resolved settings.
    pub fn validate(&self) -> Result<EncodeSettings> {
        if self.input_sources.is_empty() {
            return Err(JobError::EmptyInput);
        }
        for source in &self.input_sources {
            source.validate()?;
        }
        if let Some(d) = self.preview_duration_seconds {
            if !d.is_finite() || d <= 0.0 {
                return Err(JobError::Validation(format!(
                    "preview duration must be greater than zero, got {d}"
                )));
            }
        }
        EncodeSettings::resolve(
            self.quality_tier,
            self.output_format,
            self.override_parameters.as_ref(),
        )
    }

    pub(crate) fn truncate_for_preview(&mut self) {
        if self.input_sources.len() > MAX_PREVIEW_INPUTS {
            debug!(
                requested = self.input_sources.len(),
                kept = MAX_PREVIEW_INPUTS,
                "truncating preview inputs"
            );
            self.input_sources.truncate(MAX_PREVIEW_INPUTS);
        }
    }
}

/// Video inputs in their given order, then audio by start time. Both sorts
/// are stable so equal start times keep caller order.
pub fn normalize_sources(sources: Vec<InputSource>) -> Vec<InputSource> {
    let (videos, mut audio): (Vec<_>, Vec<_>) = sources.into_iter().partition(|s| s.is_video());
    audio.sort_by(|a, b| a.start_time_seconds.total_cmp(&b.start_time_seconds));
    videos.into_iter().chain(audio).collect()
}

/// Lays a chapter's shots end to end and places the audio that goes with them.
pub struct ManifestBuilder<'a> {
    chapter: &'a Chapter,
    only: Option<HashSet<ShotId>>,
    include_audio: bool,
}

impl<'a> ManifestBuilder<'a> {
    pub fn for_chapter(chapter: &'a Chapter) -> Self {
        Self {
            chapter,
            only: None,
            include_audio: true,
        }
    }

    pub fn only_shots(mut self, shots: impl IntoIterator<Item = ShotId>) -> Self {
        self.only = Some(shots.into_iter().collect());
        self
    }

    pub fn without_audio(mut self) -> Self {
        self.include_audio = false;
        self
    }

    pub fn build(&self) -> Vec<InputSource> {
        let mut sources = Vec::new();
        let mut shot_starts: HashMap<ShotId, f64> = HashMap::new();
        let mut cursor = 0.0;
        for shot in self.chapter.list_shots() {
            if let Some(only) = &self.only {
                if !only.contains(&shot.id()) {
                    continue;
                }
            }
            let Some(url) = shot.video_source.as_deref() else {
                debug!(shot = %shot.id(), "skipping shot without video");
                continue;
            };
            sources.push(InputSource::video(url, cursor).with_duration(shot.duration_seconds));
            shot_starts.insert(shot.id(), cursor);
            cursor += shot.duration_seconds;
        }

        if self.include_audio {
            for clip in self.chapter.audio.merge_selection() {
                let target = clip.effective_shot();
                let start = match shot_starts.get(&target) {
                    Some(start) => *start,
                    // Locked audio is part of the generated video and always goes in.
                    None if clip.locked => {
                        let start = nearest_start(&shot_starts, target);
                        debug!(
                            clip = %clip.id,
                            shot = %target,
                            start,
                            "placing locked audio on nearest rendered shot"
                        );
                        start
                    }
                    None => continue,
                };
                sources.push(
                    InputSource::audio(
                        clip.source_url.clone(),
                        start + clip.start_offset_seconds,
                        clip.volume,
                    )
                    .with_duration(clip.duration_seconds),
                );
            }
        }
        sources
    }
}

/// Start of the rendered shot closest to `target`: same scene first, then the
/// nearest scene, earlier shots winning ties. Zero when nothing is rendered.
fn nearest_start(shot_starts: &HashMap<ShotId, f64>, target: ShotId) -> f64 {
    shot_starts
        .iter()
        .min_by_key(|(id, _)| {
            (
                id.scene_number.abs_diff(target.scene_number),
                id.shot_index.abs_diff(target.shot_index),
                **id,
            )
        })
        .map_or(0.0, |(_, start)| *start)
}

/// What a runner receives for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobManifest {
    pub job_id: MergeJobId,
    pub kind: MergeKind,
    pub attempt: u32,
    pub inputs: Vec<InputSource>,
    pub settings: EncodeSettings,
    pub output_format: OutputFormat,
    #[serde(default)]
    pub preview_duration_seconds: Option<f64>,
}

impl JobManifest {
    pub fn from_job(job: &MergeJob) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            attempt: job.retry_count,
            inputs: job.input_sources.clone(),
            settings: job.encode_settings.clone(),
            output_format: job.output_format,
            preview_duration_seconds: job.preview_duration_seconds,
        }
    }

    pub fn videos(&self) -> impl Iterator<Item = &InputSource> {
        self.inputs.iter().filter(|s| s.is_video())
    }

    pub fn audio(&self) -> impl Iterator<Item = &InputSource> {
        self.inputs.iter().filter(|s| !s.is_video())
    }

    /// Length of the full merge when every input knows its duration.
    pub fn timeline_duration_seconds(&self) -> f64 {
        let video: f64 = self.videos().filter_map(|s| s.duration_seconds).sum();
        let audio = self
            .audio()
            .filter_map(InputSource::end_time_seconds)
            .fold(0.0, f64::max);
        video.max(audio)
    }

    /// Length the runner will actually write.
    pub fn output_duration_seconds(&self) -> f64 {
        let full = self.timeline_duration_seconds();
        match self.preview_duration_seconds {
            Some(cap) if self.kind == MergeKind::Preview && (full <= 0.0 || cap < full) => cap,
            _ => full,
        }
    }
}
