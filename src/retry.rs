//! Size check after an attempt and the single corrective pass it may trigger.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Accept,
    Retry {
        overage_percent: f64,
        /// Target for the next plan, shrunk by the observed overage.
        adjusted_target_bytes: f64,
    },
}

/// Negative when the output came in under target.
pub fn overage_percent(size_bytes: u64, target_bytes: f64) -> f64 {
    (size_bytes as f64 - target_bytes) / target_bytes * 100.0
}

/// Decide what follows an attempt. `retries_done` counts corrective passes
/// already run; once it reaches `max_retries` every result is accepted.
pub fn evaluate(
    size_bytes: u64,
    target_bytes: f64,
    retries_done: u32,
    max_retries: u32,
    threshold_percent: f64,
) -> RetryDecision {
    let overage = overage_percent(size_bytes, target_bytes);
    if overage <= threshold_percent || retries_done >= max_retries {
        return RetryDecision::Accept;
    }
    RetryDecision::Retry {
        overage_percent: overage,
        adjusted_target_bytes: target_bytes / (1.0 + overage / 100.0),
    }
}

/// Sibling path the corrective pass writes to, e.g. `clip.retry.mp4`.
pub fn retry_output_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let name = match output.extension() {
        Some(ext) => format!("{}.retry.{}", stem, ext.to_string_lossy()),
        None => format!("{}.retry", stem),
    };
    output.with_file_name(name)
}
