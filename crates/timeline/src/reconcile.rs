//! Matching produced video clips back to timeline shots.
//!
//! Upstream generators identify their clips inconsistently: some echo the
//! source image URL, some only keep the file name, some tag a scene token or a
//! scene sequence number. [`MatchRule::ORDERED`] lists the heuristics in
//! priority order and the first rule that holds decides the attribution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Shot, ShotId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct GenerationId(pub String);

impl GenerationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GeneratedClip {
    #[serde(default)]
    pub source_image: Option<String>,
    #[serde(default)]
    pub scene_sequence: Option<u32>,
    #[serde(default)]
    pub scene_id: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

impl GeneratedClip {
    pub fn is_usable(&self) -> bool {
        non_empty(self.video_url.as_deref()).is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Generation {
    pub id: GenerationId,
    pub created_at: DateTime<Utc>,
    pub status: GenerationStatus,
    #[serde(default)]
    pub clips: Vec<GeneratedClip>,
    #[serde(default)]
    pub top_level_video_url: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Generation {
    /// Playable when at least one clip has a video or a merged single file
    /// exists. The reported `status` is deliberately ignored: a completed job
    /// that produced nothing usable is still a failure.
    pub fn is_playable(&self) -> bool {
        self.clips.iter().any(GeneratedClip::is_usable)
            || non_empty(self.top_level_video_url.as_deref()).is_some()
    }

    pub fn usable_clips(&self) -> impl Iterator<Item = &GeneratedClip> {
        self.clips.iter().filter(|clip| clip.is_usable())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    /// `source_image` equals the shot's image URL.
    ExactImage,
    /// Last path segment of both URLs, query string removed.
    ImageFileName,
    /// `scene_id` equals `scene_{scene_number}`.
    SceneToken,
    /// `scene_sequence` equals the shot's scene number.
    SceneSequence,
}

type RulePredicate = fn(&Shot, &GeneratedClip) -> bool;

impl MatchRule {
    pub const ORDERED: [MatchRule; 4] = [
        MatchRule::ExactImage,
        MatchRule::ImageFileName,
        MatchRule::SceneToken,
        MatchRule::SceneSequence,
    ];

    fn predicate(self) -> RulePredicate {
        match self {
            Self::ExactImage => exact_image,
            Self::ImageFileName => image_file_name,
            Self::SceneToken => scene_token,
            Self::SceneSequence => scene_sequence,
        }
    }

    pub fn matches(self, shot: &Shot, clip: &GeneratedClip) -> bool {
        (self.predicate())(shot, clip)
    }
}

fn exact_image(shot: &Shot, clip: &GeneratedClip) -> bool {
    match (
        non_empty(clip.source_image.as_deref()),
        non_empty(shot.image_source.as_deref()),
    ) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn image_file_name(shot: &Shot, clip: &GeneratedClip) -> bool {
    let clip_name = clip.source_image.as_deref().and_then(file_name);
    let shot_name = shot.image_source.as_deref().and_then(file_name);
    match (clip_name, shot_name) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn scene_token(shot: &Shot, clip: &GeneratedClip) -> bool {
    let token = format!("scene_{}", shot.scene_number);
    clip.scene_id.as_deref().map(str::trim) == Some(token.as_str())
}

fn scene_sequence(shot: &Shot, clip: &GeneratedClip) -> bool {
    clip.scene_sequence == Some(shot.scene_number)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Last path segment with any query string or fragment removed.
pub fn file_name(reference: &str) -> Option<&str> {
    let without_query = reference
        .split(|c: char| c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    let name = without_query
        .trim_end_matches('/')
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();
    (!name.is_empty()).then_some(name)
}

/// First rule, in priority order, that ties `clip` to `shot`.
pub fn match_clip(shot: &Shot, clip: &GeneratedClip) -> Option<MatchRule> {
    MatchRule::ORDERED
        .into_iter()
        .find(|rule| rule.matches(shot, clip))
}

/// Decides which shot a clip belongs to. Rules are tried across every shot
/// before falling back to the next rule, so an exact image hit on one shot
/// beats a scene-number hit on another. Within a rule the earliest shot wins.
pub fn attribute_clip(clip: &GeneratedClip, shots: &[Shot]) -> Option<(ShotId, MatchRule)> {
    MatchRule::ORDERED.into_iter().find_map(|rule| {
        shots
            .iter()
            .find(|shot| rule.matches(shot, clip))
            .map(|shot| (shot.id(), rule))
    })
}

/// Best usable clip of `generation` for `shot`, with the rule that matched.
pub fn clip_for_shot<'a>(
    generation: &'a Generation,
    shot: &Shot,
) -> Option<(&'a GeneratedClip, MatchRule)> {
    MatchRule::ORDERED.into_iter().find_map(|rule| {
        generation
            .usable_clips()
            .find(|clip| rule.matches(shot, clip))
            .map(|clip| (clip, rule))
    })
}

#[derive(Debug, Default)]
pub struct Classification<'a> {
    pub playable: Vec<&'a Generation>,
    pub failed: Vec<&'a Generation>,
}

pub fn classify(generations: &[Generation]) -> Classification<'_> {
    let (playable, failed): (Vec<_>, Vec<_>) = generations.iter().partition(|g| g.is_playable());
    Classification { playable, failed }
}

/// Playable generations holding at least one clip that belongs to `shot`.
pub fn filter_for_shot<'a>(generations: &'a [Generation], shot: &Shot) -> Vec<&'a Generation> {
    generations
        .iter()
        .filter(|g| g.is_playable())
        .filter(|g| clip_for_shot(g, shot).is_some())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShotAssignment {
    pub shot: ShotId,
    pub video_url: String,
    pub rule: MatchRule,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileReport {
    pub generation: GenerationId,
    pub assignments: Vec<ShotAssignment>,
    /// Usable clips no rule could place; still playable, just not on a shot.
    pub unassociated: Vec<String>,
}

impl ReconcileReport {
    pub fn is_fully_matched(&self) -> bool {
        self.unassociated.is_empty()
    }
}

/// Places the usable clips of `generation` onto `shots`, one clip per shot.
///
/// Rules are applied in priority order across every (clip, shot) pair, so a
/// lower rule only sees the shots and clips no higher rule claimed. Within a
/// rule, shots are filled in timeline order from the earliest unclaimed clip,
/// which lets several scene-level clips spread over a multi-shot scene.
pub fn reconcile(generation: &Generation, shots: &[Shot]) -> ReconcileReport {
    let clips: Vec<(&GeneratedClip, &str)> = generation
        .usable_clips()
        .filter_map(|clip| non_empty(clip.video_url.as_deref()).map(|url| (clip, url)))
        .collect();
    let mut clip_taken = vec![false; clips.len()];
    let mut shot_taken: Vec<Option<(usize, MatchRule)>> = vec![None; shots.len()];

    for rule in MatchRule::ORDERED {
        for (shot_pos, shot) in shots.iter().enumerate() {
            if shot_taken[shot_pos].is_some() {
                continue;
            }
            let hit = clips
                .iter()
                .enumerate()
                .find(|(i, (clip, _))| !clip_taken[*i] && rule.matches(shot, clip));
            if let Some((clip_pos, _)) = hit {
                clip_taken[clip_pos] = true;
                shot_taken[shot_pos] = Some((clip_pos, rule));
            }
        }
    }

    let assignments = shots
        .iter()
        .zip(&shot_taken)
        .filter_map(|(shot, taken)| {
            taken.map(|(clip_pos, rule)| ShotAssignment {
                shot: shot.id(),
                video_url: clips[clip_pos].1.to_string(),
                rule,
            })
        })
        .collect();
    let unassociated = clips
        .iter()
        .zip(&clip_taken)
        .filter(|(_, taken)| !**taken)
        .map(|((_, url), _)| url.to_string())
        .collect();
    ReconcileReport {
        generation: generation.id.clone(),
        assignments,
        unassociated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ShotType;

    fn shot(scene: u32, index: u32, image: Option<&str>) -> Shot {
        let mut shot = Shot::new(scene, index, ShotType::KeyScene);
        shot.image_source = image.map(String::from);
        shot
    }

    fn clip(video: Option<&str>) -> GeneratedClip {
        GeneratedClip {
            video_url: video.map(String::from),
            ..GeneratedClip::default()
        }
    }

    fn generation(status: GenerationStatus, clips: Vec<GeneratedClip>) -> Generation {
        Generation {
            id: GenerationId::new("gen"),
            created_at: Utc::now(),
            status,
            clips,
            top_level_video_url: None,
            error_message: None,
        }
    }

    #[test]
    fn test_file_name_strips_query() {
        assert_eq!(file_name("https://x/y/a.png?sig=1&t=2"), Some("a.png"));
        assert_eq!(file_name("https://x/y/a.png#frag"), Some("a.png"));
        assert_eq!(file_name("a.png"), Some("a.png"));
        assert_eq!(file_name("https://x/y/"), Some("y"));
        assert_eq!(file_name("?only=query"), None);
    }

    #[test]
    fn test_each_rule_in_isolation() {
        let s = shot(3, 0, Some("https://cdn/img/a.png"));

        let mut exact = clip(Some("v.mp4"));
        exact.source_image = Some("https://cdn/img/a.png".into());
        assert_eq!(match_clip(&s, &exact), Some(MatchRule::ExactImage));

        let mut by_name = clip(Some("v.mp4"));
        by_name.source_image = Some("https://other-host/bucket/a.png?token=abc".into());
        assert_eq!(match_clip(&s, &by_name), Some(MatchRule::ImageFileName));

        let mut token = clip(Some("v.mp4"));
        token.scene_id = Some("scene_3".into());
        assert_eq!(match_clip(&s, &token), Some(MatchRule::SceneToken));

        let mut seq = clip(Some("v.mp4"));
        seq.scene_sequence = Some(3);
        assert_eq!(match_clip(&s, &seq), Some(MatchRule::SceneSequence));

        let mut none = clip(Some("v.mp4"));
        none.scene_id = Some("scene_30".into());
        none.scene_sequence = Some(4);
        assert_eq!(match_clip(&s, &none), None);
    }

    #[test]
    fn test_exact_image_beats_sequence_on_other_shot() {
        let shots = vec![
            shot(3, 0, Some("https://x/a.png")),
            shot(5, 0, Some("https://x/e.png")),
        ];
        let mut c = clip(Some("https://x/out.mp4"));
        c.source_image = Some("https://x/a.png".into());
        c.scene_sequence = Some(5);
        assert_eq!(
            attribute_clip(&c, &shots),
            Some((ShotId::new(3, 0), MatchRule::ExactImage))
        );
    }

    #[test]
    fn test_completed_with_no_clips_is_failed() {
        let gens = vec![
            generation(GenerationStatus::Completed, vec![]),
            generation(GenerationStatus::Completed, vec![clip(Some("  "))]),
            generation(GenerationStatus::Failed, vec![clip(Some("v.mp4"))]),
        ];
        let classified = classify(&gens);
        assert_eq!(classified.failed.len(), 2);
        assert_eq!(classified.playable.len(), 1);
        assert_eq!(classified.playable[0].status, GenerationStatus::Failed);
    }

    #[test]
    fn test_top_level_video_is_playable() {
        let mut g = generation(GenerationStatus::Processing, vec![]);
        g.top_level_video_url = Some("https://x/merged.mp4".into());
        assert!(g.is_playable());
    }

    #[test]
    fn test_filter_for_shot_skips_failed_and_unmatched() {
        let s = shot(2, 0, Some("https://x/b.png"));
        let mut matching = clip(Some("https://x/b.mp4"));
        matching.scene_id = Some("scene_2".into());
        let mut unusable = clip(None);
        unusable.scene_id = Some("scene_2".into());
        let mut other = clip(Some("https://x/c.mp4"));
        other.scene_sequence = Some(9);

        let gens = vec![
            generation(GenerationStatus::Completed, vec![matching]),
            generation(GenerationStatus::Completed, vec![unusable]),
            generation(GenerationStatus::Completed, vec![other]),
        ];
        let hits = filter_for_shot(&gens, &s);
        assert_eq!(hits.len(), 1);
        assert!(std::ptr::eq(hits[0], &gens[0]));
    }

    #[test]
    fn test_reconcile_reports_unassociated() {
        let shots = vec![shot(1, 0, Some("https://x/a.png")), shot(1, 1, None)];
        let mut a = clip(Some("https://x/a.mp4"));
        a.source_image = Some("https://x/a.png".into());
        let mut stray = clip(Some("https://x/z.mp4"));
        stray.scene_id = Some("scene_7".into());
        let g = generation(GenerationStatus::Completed, vec![a, stray, clip(None)]);

        let report = reconcile(&g, &shots);
        assert_eq!(report.assignments.len(), 1);
        assert_eq!(report.assignments[0].shot, ShotId::new(1, 0));
        assert_eq!(report.unassociated, vec!["https://x/z.mp4".to_string()]);
        assert!(!report.is_fully_matched());
    }

    #[test]
    fn test_reconcile_prefers_exact_clip_listed_later() {
        let shots = vec![shot(1, 0, Some("https://x/a.png"))];
        let mut by_seq = clip(Some("https://x/seq.mp4"));
        by_seq.scene_sequence = Some(1);
        let mut exact = clip(Some("https://x/exact.mp4"));
        exact.source_image = Some("https://x/a.png".into());
        let g = generation(GenerationStatus::Completed, vec![by_seq, exact]);

        let report = reconcile(&g, &shots);
        assert_eq!(
            report.assignments,
            vec![ShotAssignment {
                shot: ShotId::new(1, 0),
                video_url: "https://x/exact.mp4".into(),
                rule: MatchRule::ExactImage,
            }]
        );
        assert_eq!(report.unassociated, vec!["https://x/seq.mp4".to_string()]);
        let (picked, _) = clip_for_shot(&g, &shots[0]).unwrap();
        assert_eq!(picked.video_url.as_deref(), Some("https://x/exact.mp4"));
    }

    #[test]
    fn test_reconcile_spreads_scene_clips_over_shots() {
        let shots = vec![shot(1, 0, None), shot(1, 1, None), shot(2, 0, None)];
        let mut a = clip(Some("https://x/a.mp4"));
        a.scene_sequence = Some(1);
        let mut b = clip(Some("https://x/b.mp4"));
        b.scene_sequence = Some(1);
        let mut c = clip(Some("https://x/c.mp4"));
        c.scene_id = Some("scene_2".into());
        let g = generation(GenerationStatus::Completed, vec![a, b, c]);

        let report = reconcile(&g, &shots);
        let placed: Vec<(ShotId, &str)> = report
            .assignments
            .iter()
            .map(|a| (a.shot, a.video_url.as_str()))
            .collect();
        assert_eq!(
            placed,
            vec![
                (ShotId::new(1, 0), "https://x/a.mp4"),
                (ShotId::new(1, 1), "https://x/b.mp4"),
                (ShotId::new(2, 0), "https://x/c.mp4"),
            ]
        );
        assert!(report.is_fully_matched());
    }
}
