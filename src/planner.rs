//! Bitrate planning: turn a size target and duration into video/audio rates.

use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::AppError;

pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AudioPolicy {
    /// Walk the ladder for the highest rate that keeps video above the floor.
    Auto,
    Fixed(u32),
    Muted,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BitratePlan {
    pub total_kbps: f64,
    pub video_kbps: f64,
    pub audio_kbps: u32,
    /// Video fell below the configured floor. Encoding still goes ahead.
    pub low_quality: bool,
    /// Audio got less than the policy asked for (0 means no audio track).
    pub audio_capped: bool,
}

/// `bytes * 8 / seconds`, in kbit/s with 1024-bit kilobits.
pub fn total_kbps(target_bytes: f64, duration_secs: f64) -> f64 {
    target_bytes * 8.0 / duration_secs / 1024.0
}

pub fn plan(
    target_bytes: f64,
    duration_secs: f64,
    audio: AudioPolicy,
    config: &EngineConfig,
) -> Result<BitratePlan, AppError> {
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return Err(AppError::InvalidDuration(duration_secs));
    }
    if !target_bytes.is_finite() || target_bytes <= 0.0 {
        return Err(AppError::InvalidTargetSize(target_bytes));
    }

    let total = (total_kbps(target_bytes, duration_secs) - config.container_overhead_kbps).max(1.0);
    let floor = config.min_video_kbps;

    let (requested, low_quality) = match audio {
        AudioPolicy::Muted => (0, total < floor),
        AudioPolicy::Fixed(kbps) => (kbps, total - (kbps as f64) < floor),
        AudioPolicy::Auto => {
            let ladder = config.audio_ladder();
            match ladder.iter().copied().find(|a| total - (*a as f64) >= floor) {
                Some(a) => (a, false),
                None => (ladder.last().copied().unwrap_or(0), true),
            }
        }
    };
    let audio_kbps = cap_audio(requested, total);
    let audio_capped = audio_kbps < requested;
    let video_kbps = total - audio_kbps as f64;

    if low_quality {
        log::warn!(
            target: "sizefit::planner",
            "Video bitrate {:.0}k is below the {:.0}k floor; output quality will suffer",
            video_kbps,
            floor
        );
    }
    log::debug!(
        target: "sizefit::planner",
        "Plan: total={:.1}k video={:.1}k audio={}k over {:.2}s",
        total,
        video_kbps,
        audio_kbps,
        duration_secs
    );
    Ok(BitratePlan {
        total_kbps: total,
        video_kbps,
        audio_kbps,
        low_quality,
        audio_capped,
    })
}

/// Audio never takes more than half a budget it would otherwise exhaust.
fn cap_audio(kbps: u32, total: f64) -> u32 {
    if (kbps as f64) < total {
        kbps
    } else {
        (total / 2.0).floor() as u32
    }
}
