//! Parsing of the `-progress pipe:1` key=value stream and normalisation into
//! percentage/phase samples.

use regex::Regex;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

static OUT_TIME_US_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^out_time_(?:ms|us)=(-?\d+)$").expect("invalid out_time regex")
});
static OUT_TIME_CLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^out_time=(\d+):(\d+):([\d.]+)$").expect("invalid out_time clock regex")
});

/// Keys forwarded to observers as `log` events.
const STAT_KEYS: &[&str] = &["bitrate", "total_size", "speed"];

/// Display-only sub-state of a running attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Encoding,
    Finalizing,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressLine {
    /// Cumulative media time processed, in seconds.
    OutTime(f64),
    Stat { key: String, value: String },
    Continue,
    End,
}

/// Parse one line of the progress stream. Unknown keys yield None.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let line = line.trim();
    if let Some(caps) = OUT_TIME_US_RE.captures(line) {
        // FFmpeg reports both out_time_ms and out_time_us in microseconds.
        let micros: i64 = caps[1].parse().unwrap_or(0);
        return Some(ProgressLine::OutTime(micros.max(0) as f64 / 1_000_000.0));
    }
    if let Some(caps) = OUT_TIME_CLOCK_RE.captures(line) {
        let hours: f64 = caps[1].parse().unwrap_or(0.0);
        let minutes: f64 = caps[2].parse().unwrap_or(0.0);
        let seconds: f64 = caps[3].parse().unwrap_or(0.0);
        return Some(ProgressLine::OutTime(hours * 3600.0 + minutes * 60.0 + seconds));
    }
    let (key, value) = line.split_once('=')?;
    match key {
        "progress" if value == "end" => Some(ProgressLine::End),
        "progress" => Some(ProgressLine::Continue),
        k if STAT_KEYS.contains(&k) => Some(ProgressLine::Stat {
            key: k.to_string(),
            value: value.to_string(),
        }),
        _ => None,
    }
}

/// `min(100, 100 * processed / total)`; zero when the total is unknown.
pub fn percent_of(processed_secs: f64, total_secs: f64) -> f64 {
    if total_secs <= 0.0 || !processed_secs.is_finite() {
        return 0.0;
    }
    (100.0 * processed_secs / total_secs).clamp(0.0, 100.0)
}

pub fn phase_for(percent: f64, finalizing_threshold: f64) -> Phase {
    if percent < finalizing_threshold {
        Phase::Encoding
    } else {
        Phase::Finalizing
    }
}

/// Per-attempt tracker. Keeps percentage monotonic and throttles emits.
pub struct ProgressTracker {
    total_secs: f64,
    finalizing_threshold: f64,
    min_interval: Duration,
    last_percent: f64,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(total_secs: f64, finalizing_threshold: f64, min_interval: Duration) -> Self {
        Self {
            total_secs,
            finalizing_threshold,
            min_interval,
            last_percent: 0.0,
            last_emit: None,
        }
    }

    pub fn last_percent(&self) -> f64 {
        self.last_percent
    }

    /// Feed a processed-time sample. Returns a sample to publish, if any.
    pub fn observe(&mut self, processed_secs: f64) -> Option<(f64, Phase)> {
        let raw = percent_of(processed_secs, self.total_secs);
        if raw <= self.last_percent && self.last_emit.is_some() {
            return None;
        }
        let percent = raw.max(self.last_percent);
        let now = Instant::now();
        let should_emit = match self.last_emit {
            None => true,
            Some(last) => {
                now.duration_since(last) >= self.min_interval
                    || percent - self.last_percent >= 1.0
                    || percent >= 100.0
                    || (self.last_percent < self.finalizing_threshold
                        && percent >= self.finalizing_threshold)
            }
        };
        if !should_emit {
            return None;
        }
        self.last_emit = Some(now);
        self.last_percent = percent;
        Some((round2(percent), phase_for(percent, self.finalizing_threshold)))
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
