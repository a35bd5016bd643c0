use serde::{Deserialize, Serialize};

use crate::{JobError, OutputFormat, QualityTier, Result};

pub const MAX_FPS: u32 = 120;
pub const MAX_CRF: u8 = 51;

const WEBM_VIDEO_CODECS: &[&str] = &["libvpx", "libvpx-vp9", "libaom-av1", "libsvtav1"];
const WEBM_AUDIO_CODECS: &[&str] = &["libopus", "libvorbis"];

/// Caller-supplied encoder overrides, applied on top of the quality tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverrideParameters {
    #[serde(default)]
    pub video_codec: Option<String>,
    #[serde(default)]
    pub audio_codec: Option<String>,
    /// `WIDTHxHEIGHT`, e.g. `1280x720`.
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub fps: Option<u32>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub crf: Option<u8>,
}

impl OverrideParameters {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(res) = &self.resolution {
            parse_resolution(res)?;
        }
        if let Some(fps) = self.fps {
            if fps == 0 || fps > MAX_FPS {
                return Err(JobError::Validation(format!(
                    "fps {fps} outside 1..={MAX_FPS}"
                )));
            }
        }
        if let Some(crf) = self.crf {
            if crf > MAX_CRF {
                return Err(JobError::Validation(format!(
                    "crf {crf} outside 0..={MAX_CRF}"
                )));
            }
        }
        for (name, value) in [
            ("video codec", &self.video_codec),
            ("audio codec", &self.audio_codec),
            ("preset", &self.preset),
        ] {
            if let Some(v) = value {
                if v.trim().is_empty() || v.chars().any(char::is_whitespace) {
                    return Err(JobError::Validation(format!("invalid {name} {v:?}")));
                }
            }
        }
        Ok(())
    }
}

/// Parses `WIDTHxHEIGHT` into positive dimensions.
pub fn parse_resolution(s: &str) -> Result<(u32, u32)> {
    let invalid = || JobError::Validation(format!("resolution {s:?} is not WIDTHxHEIGHT"));
    let (w, h) = s
        .trim()
        .split_once(|c: char| c == 'x' || c == 'X')
        .ok_or_else(invalid)?;
    let width: u32 = w.trim().parse().map_err(|_| invalid())?;
    let height: u32 = h.trim().parse().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

/// Concrete encoder parameters handed to the runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncodeSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_codec: String,
    pub audio_codec: String,
    pub crf: u8,
    pub preset: String,
}

impl EncodeSettings {
    /// Tier defaults, container codecs, then overrides. `Custom` has no
    /// defaults of its own and needs at least one override.
    pub fn resolve(
        tier: QualityTier,
        format: OutputFormat,
        overrides: Option<&OverrideParameters>,
    ) -> Result<Self> {
        let (width, height, crf, preset) = match tier {
            QualityTier::Web => (1280, 720, 28, "veryfast"),
            QualityTier::Medium | QualityTier::Custom => (1920, 1080, 23, "medium"),
            QualityTier::High => (1920, 1080, 18, "slow"),
        };
        let (video_codec, audio_codec) = match format {
            OutputFormat::Mp4 | OutputFormat::Mov => ("libx264", "aac"),
            OutputFormat::WebM => ("libvpx-vp9", "libopus"),
        };
        let mut settings = EncodeSettings {
            width,
            height,
            fps: 30,
            video_codec: video_codec.into(),
            audio_codec: audio_codec.into(),
            crf,
            preset: preset.into(),
        };

        let overrides = overrides.filter(|o| !o.is_empty());
        if tier == QualityTier::Custom && overrides.is_none() {
            return Err(JobError::Validation(
                "custom quality tier requires override parameters".into(),
            ));
        }
        if let Some(o) = overrides {
            o.validate()?;
            if let Some(res) = &o.resolution {
                (settings.width, settings.height) = parse_resolution(res)?;
            }
            if let Some(fps) = o.fps {
                settings.fps = fps;
            }
            if let Some(crf) = o.crf {
                settings.crf = crf;
            }
            if let Some(preset) = &o.preset {
                settings.preset = preset.clone();
            }
            if let Some(codec) = &o.video_codec {
                settings.video_codec = codec.clone();
            }
            if let Some(codec) = &o.audio_codec {
                settings.audio_codec = codec.clone();
            }
        }

        if format == OutputFormat::WebM {
            if !WEBM_VIDEO_CODECS.contains(&settings.video_codec.as_str()) {
                return Err(JobError::Validation(format!(
                    "video codec {} cannot be written to webm",
                    settings.video_codec
                )));
            }
            if !WEBM_AUDIO_CODECS.contains(&settings.audio_codec.as_str()) {
                return Err(JobError::Validation(format!(
                    "audio codec {} cannot be written to webm",
                    settings.audio_codec
                )));
            }
        }
        Ok(settings)
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    pub(crate) fn is_vpx(&self) -> bool {
        self.video_codec.starts_with("libvpx")
    }
}
