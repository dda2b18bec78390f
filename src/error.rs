//! Engine error type. Implements Display and Serialize for event consumers.

use crate::ffmpeg::parse_ffmpeg_error;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    FfmpegNotFound(String),

    #[error("Invalid duration: {0}s (must be greater than zero)")]
    InvalidDuration(f64),

    #[error("Invalid target size: {0} bytes")]
    InvalidTargetSize(f64),

    #[error("No working encoder available for '{requested}'")]
    NoEncoderAvailable { requested: String },

    #[error("FFmpeg failed (code {code}): {stderr}")]
    EncodeFailed { code: i32, stderr: String },

    #[error("Canceled")]
    Canceled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl AppError {
    pub fn canceled() -> Self {
        Self::Canceled
    }

    pub fn encode_failed(code: i32, stderr: impl Into<String>) -> Self {
        Self::EncodeFailed {
            code,
            stderr: stderr.into(),
        }
    }

    /// Short message suitable for an `error` event.
    pub fn user_message(&self) -> String {
        match self {
            AppError::EncodeFailed { code, stderr } if *code != -1 => {
                let payload = parse_ffmpeg_error(stderr, Some(*code));
                let tail = tail_lines(&payload.detail, 20);
                if tail.is_empty() {
                    payload.summary
                } else {
                    format!("{}\nLast stderr output:\n{}", payload.summary, tail)
                }
            }
            AppError::EncodeFailed { stderr, .. } => stderr.clone(),
            _ => self.to_string(),
        }
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            AppError::EncodeFailed { code, stderr } => {
                let payload = parse_ffmpeg_error(stderr, Some(*code));
                let json =
                    serde_json::json!({ "summary": payload.summary, "detail": payload.detail });
                serializer.serialize_str(&json.to_string())
            }
            _ => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl From<String> for AppError {
    fn from(s: String) -> Self {
        if s == "Canceled" {
            AppError::Canceled
        } else {
            AppError::EncodeFailed {
                code: -1,
                stderr: s,
            }
        }
    }
}

impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}
