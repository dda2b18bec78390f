//! Turn a failed FFmpeg run into a short summary plus the raw stderr.
//!
//! Recognised stderr causes win over the exit code, which on its own only
//! says "something failed" (1), "rate exceeded" (69) or "stopped" (123, 255).

use serde::Serialize;

/// Summary for the `error` event; detail carries the stderr.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FfmpegErrorPayload {
    pub summary: String,
    pub detail: String,
}

/// Lowercased stderr needle and the summary it maps to. First match wins.
const STDERR_CAUSES: &[(&str, &str)] = &[
    ("no space left on device", "Output disk is full."),
    ("permission denied", "Permission denied reading the source or writing the output."),
    ("no such file or directory", "Source or output path does not exist."),
    ("invalid data found when processing input", "Source file is not a readable video."),
    ("moov atom not found", "Source file is truncated or incomplete."),
    ("unknown encoder", "Encoder is not available in this FFmpeg build."),
    ("error while opening encoder", "Encoder rejected the requested settings."),
    ("no nvenc capable devices found", "NVENC device became unavailable."),
    ("device creation failed", "Hardware device could not be initialised."),
];

pub fn parse_ffmpeg_error(stderr: &str, exit_code: Option<i32>) -> FfmpegErrorPayload {
    let detail = stderr.trim().to_string();
    let lower = detail.to_lowercase();
    let summary = STDERR_CAUSES
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, summary)| summary.to_string())
        .or_else(|| exit_code.map(exit_code_summary))
        .unwrap_or_else(|| first_line(&detail, 120));
    FfmpegErrorPayload { summary, detail }
}

fn exit_code_summary(code: i32) -> String {
    match code {
        -1 => "FFmpeg not found or failed to start.".into(),
        0 => "FFmpeg produced no output.".into(),
        1 => "FFmpeg failed.".into(),
        69 => "Encoding rate limit exceeded.".into(),
        123 | 255 => "Encoding was stopped.".into(),
        other => format!("FFmpeg failed (exit code {}).", other),
    }
}

/// First non-empty line, cut to `max_len` bytes on a char boundary.
fn first_line(text: &str, max_len: usize) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if line.len() <= max_len {
        return line.to_string();
    }
    let mut cut = max_len - '…'.len_utf8();
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &line[..cut])
}
