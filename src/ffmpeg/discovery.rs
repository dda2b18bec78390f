use crate::error::AppError;
use std::path::{Path, PathBuf};
use std::process::Command;

#[cfg(target_os = "windows")]
fn find_in_path() -> Option<PathBuf> {
    let output = Command::new("where").arg("ffmpeg").output().ok()?;
    first_line_path(output)
}

#[cfg(not(target_os = "windows"))]
fn find_in_path() -> Option<PathBuf> {
    let output = Command::new("which").arg("ffmpeg").output().ok()?;
    first_line_path(output)
}

fn first_line_path(output: std::process::Output) -> Option<PathBuf> {
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.lines().next()?.trim();
    if first.is_empty() {
        None
    } else {
        Some(PathBuf::from(first))
    }
}

fn common_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/opt/homebrew/bin/ffmpeg"),
            PathBuf::from("/usr/local/bin/ffmpeg"),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        vec![
            PathBuf::from("C:\\ffmpeg\\bin\\ffmpeg.exe"),
            PathBuf::from("C:\\Program Files\\ffmpeg\\bin\\ffmpeg.exe"),
        ]
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        vec![
            PathBuf::from("/usr/bin/ffmpeg"),
            PathBuf::from("/usr/local/bin/ffmpeg"),
            PathBuf::from("/usr/lib/jellyfin-ffmpeg/ffmpeg"),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", unix)))]
    {
        vec![]
    }
}

/// Locate the FFmpeg binary.
///
/// Order: explicit override, `FFMPEG_PATH`, common install paths, then `PATH`.
/// An override that does not exist is an error rather than a silent fallback.
pub fn resolve_ffmpeg_path(override_path: Option<&Path>) -> Result<PathBuf, AppError> {
    if let Some(path) = override_path {
        if path.exists() {
            log::debug!(
                target: "sizefit::ffmpeg::discovery",
                "FFmpeg path from config: {}",
                path.display()
            );
            return Ok(path.to_path_buf());
        }
        return Err(AppError::FfmpegNotFound(format!(
            "Configured FFmpeg path does not exist: {}",
            path.display()
        )));
    }

    if let Ok(env_path) = std::env::var("FFMPEG_PATH") {
        let p = PathBuf::from(&env_path);
        if p.exists() {
            log::debug!(
                target: "sizefit::ffmpeg::discovery",
                "FFmpeg path from FFMPEG_PATH env: {}",
                p.display()
            );
            return Ok(p);
        }
        log::warn!(
            target: "sizefit::ffmpeg::discovery",
            "FFMPEG_PATH points at a missing file: {}",
            env_path
        );
    }

    for path in common_paths() {
        if path.exists() {
            log::debug!(
                target: "sizefit::ffmpeg::discovery",
                "FFmpeg found in common path: {}",
                path.display()
            );
            return Ok(path);
        }
    }

    if let Some(p) = find_in_path().filter(|p| p.exists()) {
        log::debug!(
            target: "sizefit::ffmpeg::discovery",
            "FFmpeg found in PATH: {}",
            p.display()
        );
        return Ok(p);
    }

    log::error!(
        target: "sizefit::ffmpeg::discovery",
        "FFmpeg not found in PATH or common locations"
    );
    Err(AppError::FfmpegNotFound(
        "FFmpeg not found. Install FFmpeg or set FFMPEG_PATH / SIZEFIT_FFMPEG_PATH.".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_override_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fake = dir.path().join("ffmpeg");
        std::fs::write(&fake, b"").expect("write");
        let resolved = resolve_ffmpeg_path(Some(&fake)).expect("resolve");
        assert_eq!(resolved, fake);
    }

    #[test]
    fn missing_override_is_not_found() {
        let err = resolve_ffmpeg_path(Some(Path::new("/definitely/not/here/ffmpeg")))
            .expect_err("missing");
        assert!(matches!(err, AppError::FfmpegNotFound(_)));
    }
}
