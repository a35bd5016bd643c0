use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::FfmpegRunnerConfig;

/// Hard ceiling on retries per job.
pub const MAX_RETRIES: u32 = 3;

/// Exponential backoff for runner submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt`, capped. `attempt` is 0-based.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    /// How often a running job's runner status is polled.
    pub poll_interval_ms: u64,
    /// A job with no observable change for this long is failed.
    pub stall_timeout_secs: u64,
    /// Consecutive transient status errors tolerated before a job is lost.
    pub max_status_errors: u32,
    pub preview_duration_secs: f64,
    /// Clamped to [`MAX_RETRIES`].
    pub max_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval_ms: 500,
            stall_timeout_secs: 600,
            max_status_errors: 5,
            preview_duration_secs: 30.0,
            max_retries: MAX_RETRIES,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_stall_timeout(mut self, secs: u64) -> Self {
        self.stall_timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn retry_limit(&self) -> u32 {
        self.max_retries.min(MAX_RETRIES)
    }
}

/// Everything the `chapter-merge` binary reads from its config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    pub orchestrator: OrchestratorConfig,
    pub ffmpeg: FfmpegRunnerConfig,
}

impl MergeConfig {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.compute_delay(0), Duration::from_millis(250));
        assert_eq!(policy.compute_delay(1), Duration::from_millis(500));
        assert_eq!(policy.compute_delay(3), Duration::from_millis(2_000));
        assert_eq!(policy.compute_delay(10), Duration::from_millis(5_000));
        assert_eq!(policy.compute_delay(200), Duration::from_millis(5_000));
    }

    #[test]
    fn test_retry_limit_is_clamped() {
        let config = OrchestratorConfig::default().with_max_retries(10);
        assert_eq!(config.retry_limit(), MAX_RETRIES);
        assert_eq!(config.with_max_retries(1).retry_limit(), 1);
    }

    #[test]
    fn test_config_file_round_trip_with_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merge.json");
        std::fs::write(&path, r#"{ "orchestrator": { "poll_interval_ms": 50 } }"#).unwrap();
        let config = MergeConfig::load(&path).unwrap();
        assert_eq!(config.orchestrator.poll_interval_ms, 50);
        assert_eq!(config.orchestrator.stall_timeout_secs, 600);
        assert_eq!(config.ffmpeg.max_concurrent, 1);

        config.save(&path).unwrap();
        assert_eq!(MergeConfig::load(&path).unwrap(), config);
    }
}
