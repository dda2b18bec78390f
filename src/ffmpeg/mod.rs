mod builder;
pub mod discovery;
mod error;
mod progress;
mod runner;

pub use builder::{
    TranscodeParams, build_decode_probe_args, build_encoder_probe_args, build_probe_clip_args,
    build_transcode_args, format_args_for_display, parse_timestamp, trimmed_duration,
};
pub use discovery::resolve_ffmpeg_path;
pub use error::{FfmpegErrorPayload, parse_ffmpeg_error};
pub use progress::{
    Phase, ProgressLine, ProgressTracker, parse_progress_line, percent_of, phase_for,
};
pub use runner::{CapturedRun, RunEvent, RunSettings, run_ffmpeg, run_ffmpeg_captured};

/// Path to string for FFmpeg args or logging.
pub fn path_to_string(path: &(impl AsRef<std::path::Path> + ?Sized)) -> String {
    path.as_ref().to_string_lossy().to_string()
}
