//! Engine configuration. Defaults, `SIZEFIT_*` environment overrides and an
//! optional JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

/// Descending ladder the auto audio policy walks.
pub const DEFAULT_AUDIO_LADDER_KBPS: &[u32] = &[256, 192, 160, 128, 96, 64, 48, 32];

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    /// Concurrent encode slots. Fixed for the process lifetime.
    pub max_concurrency: usize,
    pub ffmpeg_path: Option<PathBuf>,
    /// Where outputs go when a job does not name one.
    pub output_dir: PathBuf,
    pub overage_threshold_percent: f64,
    pub max_retries: u32,
    pub min_video_kbps: f64,
    pub container_overhead_kbps: f64,
    pub audio_ladder_kbps: Vec<u32>,
    pub finalizing_threshold_percent: f64,
    pub cancel_grace_ms: u64,
    pub probe_timeout_ms: u64,
    pub vaapi_device: String,
    pub event_capacity: usize,
    pub progress_emit_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            ffmpeg_path: None,
            output_dir: std::env::temp_dir().join("sizefit"),
            overage_threshold_percent: 2.0,
            max_retries: 1,
            min_video_kbps: 100.0,
            container_overhead_kbps: 0.0,
            audio_ladder_kbps: DEFAULT_AUDIO_LADDER_KBPS.to_vec(),
            finalizing_threshold_percent: 95.0,
            cancel_grace_ms: 3000,
            probe_timeout_ms: 10_000,
            vaapi_device: "/dev/dri/renderD128".to_string(),
            event_capacity: 256,
            progress_emit_interval_ms: 150,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with any `SIZEFIT_*` variables that are set.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_json_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            AppError::Config(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = Self::default();
        if let Some(v) = lookup("SIZEFIT_MAX_CONCURRENCY") {
            config.max_concurrency = parse_var("SIZEFIT_MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("SIZEFIT_FFMPEG_PATH") {
            config.ffmpeg_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SIZEFIT_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SIZEFIT_OVERAGE_THRESHOLD_PERCENT") {
            config.overage_threshold_percent = parse_var("SIZEFIT_OVERAGE_THRESHOLD_PERCENT", &v)?;
        }
        if let Some(v) = lookup("SIZEFIT_MIN_VIDEO_KBPS") {
            config.min_video_kbps = parse_var("SIZEFIT_MIN_VIDEO_KBPS", &v)?;
        }
        if let Some(v) = lookup("SIZEFIT_CONTAINER_OVERHEAD_KBPS") {
            config.container_overhead_kbps = parse_var("SIZEFIT_CONTAINER_OVERHEAD_KBPS", &v)?;
        }
        if let Some(v) = lookup("SIZEFIT_CANCEL_GRACE_MS") {
            config.cancel_grace_ms = parse_var("SIZEFIT_CANCEL_GRACE_MS", &v)?;
        }
        if let Some(v) = lookup("SIZEFIT_PROBE_TIMEOUT_MS") {
            config.probe_timeout_ms = parse_var("SIZEFIT_PROBE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("SIZEFIT_VAAPI_DEVICE") {
            config.vaapi_device = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_concurrency == 0 {
            return Err(AppError::Config("max_concurrency must be at least 1".into()));
        }
        if !(self.overage_threshold_percent >= 0.0) {
            return Err(AppError::Config(
                "overage_threshold_percent must be non-negative".into(),
            ));
        }
        if !(self.min_video_kbps > 0.0) {
            return Err(AppError::Config("min_video_kbps must be positive".into()));
        }
        if !(self.container_overhead_kbps >= 0.0) {
            return Err(AppError::Config(
                "container_overhead_kbps must be non-negative".into(),
            ));
        }
        if self.audio_ladder_kbps.is_empty() {
            return Err(AppError::Config("audio_ladder_kbps must not be empty".into()));
        }
        if self.event_capacity == 0 {
            return Err(AppError::Config("event_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// At most one corrective pass, whatever the file says.
    pub fn effective_max_retries(&self) -> u32 {
        self.max_retries.min(1)
    }

    /// Ladder sorted highest first with duplicates removed.
    pub fn audio_ladder(&self) -> Vec<u32> {
        let mut ladder = self.audio_ladder_kbps.clone();
        ladder.sort_unstable_by(|a, b| b.cmp(a));
        ladder.dedup();
        ladder
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn progress_emit_interval(&self) -> Duration {
        Duration::from_millis(self.progress_emit_interval_ms)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| AppError::Config(format!("{}={:?}: {}", key, value, e)))
}
