//! FFmpeg process spawning and progress parsing.
//!
//! Spawns FFmpeg as a tokio child process, reads the `-progress pipe:1` stream
//! from stdout and forwards stderr lines as best-effort log events. A
//! cancellation token stops the process with SIGTERM, then a kill once the
//! grace period runs out.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::progress::{Phase, ProgressLine, ProgressTracker, parse_progress_line};
use crate::error::AppError;

/// Keep only the last N bytes of stderr to avoid unbounded memory growth.
const MAX_STDERR_BYTES: usize = 64 * 1024;
/// Stderr lines waiting to become log events. Extra lines are dropped.
const LOG_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Media seconds the attempt will process. Zero disables percentages.
    pub total_secs: f64,
    pub finalizing_threshold: f64,
    pub emit_interval: Duration,
    pub cancel_grace: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Progress { percent: f64, phase: Phase },
    Log(String),
}

enum Step {
    Cancel,
    Stdout(std::io::Result<Option<String>>),
    Stderr(Option<String>),
}

async fn collect_stderr<R: AsyncRead + Unpin>(
    reader: R,
    buffer: Arc<Mutex<Vec<u8>>>,
    log_tx: mpsc::Sender<String>,
) {
    let mut reader = BufReader::new(reader);
    let mut line_buf = Vec::with_capacity(256);
    while reader.read_until(b'\n', &mut line_buf).await.unwrap_or(0) > 0 {
        let line = String::from_utf8_lossy(&line_buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        {
            let mut guard = buffer.lock();
            guard.extend_from_slice(line.as_bytes());
            guard.push(b'\n');
            if guard.len() > MAX_STDERR_BYTES {
                let excess = guard.len() - MAX_STDERR_BYTES;
                guard.drain(..excess);
            }
        }
        if !line.trim().is_empty() {
            let _ = log_tx.try_send(line);
        }
        line_buf.clear();
    }
}

fn handle_stdout_line(
    line: &str,
    tracker: &mut ProgressTracker,
    on_event: &mut impl FnMut(RunEvent),
) {
    match parse_progress_line(line) {
        Some(ProgressLine::OutTime(secs)) => {
            if let Some((percent, phase)) = tracker.observe(secs) {
                on_event(RunEvent::Progress { percent, phase });
            }
        }
        Some(ProgressLine::Stat { key, value }) => {
            on_event(RunEvent::Log(format!("{}={}", key, value)));
        }
        Some(ProgressLine::Continue) | Some(ProgressLine::End) | None => {}
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok(),
        None => false,
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

async fn terminate(child: &mut Child, grace: Duration) {
    if send_sigterm(child) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => {
                log::info!(
                    target: "sizefit::ffmpeg::runner",
                    "FFmpeg stopped after SIGTERM"
                );
                return;
            }
            Err(_) => log::warn!(
                target: "sizefit::ffmpeg::runner",
                "FFmpeg still running {}ms after SIGTERM, killing",
                grace.as_millis()
            ),
        }
    }
    if let Err(e) = child.kill().await {
        log::debug!(
            target: "sizefit::ffmpeg::runner",
            "Kill after cancel failed: {}",
            e
        );
    }
}

fn spawn(ffmpeg: &Path, args: &[String], capture_stdout: bool) -> Result<Child, AppError> {
    let mut cmd = Command::new(ffmpeg);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(if capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(windows)]
    cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
    cmd.spawn()
        .map_err(|e| AppError::from(format!("Failed to spawn FFmpeg: {}", e)))
}

/// Run one transcode to completion, streaming progress and logs to `on_event`.
///
/// Returns `Canceled` when the token fires before the process exits and
/// `EncodeFailed` on a non-zero exit. Output validation is the caller's job.
pub async fn run_ffmpeg(
    ffmpeg: &Path,
    args: &[String],
    settings: &RunSettings,
    cancel: &CancellationToken,
    mut on_event: impl FnMut(RunEvent),
) -> Result<(), AppError> {
    let input_arg = args
        .iter()
        .position(|a| a == "-i")
        .and_then(|i| args.get(i + 1));
    log::debug!(
        target: "sizefit::ffmpeg::runner",
        "Spawning FFmpeg: path={}, input={:?}, output={:?}",
        ffmpeg.display(),
        input_arg,
        args.last()
    );

    let mut child = spawn(ffmpeg, args, true)?;
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.kill().await;
        return Err(AppError::from("Failed to capture FFmpeg output"));
    };

    let stderr_buffer = Arc::new(Mutex::new(Vec::new()));
    let (log_tx, mut log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
    let stderr_task = tokio::spawn(collect_stderr(
        stderr,
        Arc::clone(&stderr_buffer),
        log_tx,
    ));

    let mut tracker = ProgressTracker::new(
        settings.total_secs,
        settings.finalizing_threshold,
        settings.emit_interval,
    );
    let mut lines = BufReader::new(stdout).lines();
    let mut logs_open = true;

    loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Cancel,
            line = lines.next_line() => Step::Stdout(line),
            msg = log_rx.recv(), if logs_open => Step::Stderr(msg),
        };
        match step {
            Step::Cancel => {
                if let Ok(Some(status)) = child.try_wait() {
                    log::debug!(
                        target: "sizefit::ffmpeg::runner",
                        "Cancel arrived after FFmpeg exited ({}), keeping its result",
                        status
                    );
                    break;
                }
                log::info!(
                    target: "sizefit::ffmpeg::runner",
                    "Cancel requested, stopping FFmpeg"
                );
                terminate(&mut child, settings.cancel_grace).await;
                stderr_task.abort();
                return Err(AppError::canceled());
            }
            Step::Stdout(Ok(Some(line))) => handle_stdout_line(&line, &mut tracker, &mut on_event),
            Step::Stdout(_) => break,
            Step::Stderr(Some(msg)) => on_event(RunEvent::Log(msg)),
            Step::Stderr(None) => logs_open = false,
        }
    }

    // Exit wins over a late cancel: a finished process keeps its result.
    let status = tokio::select! {
        biased;
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };
    let Some(status) = status else {
        terminate(&mut child, settings.cancel_grace).await;
        stderr_task.abort();
        return Err(AppError::canceled());
    };
    let status = status?;

    let _ = stderr_task.await;
    while let Ok(msg) = log_rx.try_recv() {
        on_event(RunEvent::Log(msg));
    }

    if status.success() {
        log::info!(
            target: "sizefit::ffmpeg::runner",
            "FFmpeg completed successfully"
        );
        return Ok(());
    }

    let stderr_str = String::from_utf8_lossy(&stderr_buffer.lock()).to_string();
    // No exit code means a signal ended it.
    let code = status.code().unwrap_or(255);
    let err_preview = stderr_str
        .lines()
        .rev()
        .take(3)
        .collect::<Vec<_>>()
        .join("; ");
    log::error!(
        target: "sizefit::ffmpeg::runner",
        "FFmpeg failed (code={}): {}",
        code,
        err_preview
    );
    Err(AppError::encode_failed(code, stderr_str))
}

/// Result of a short, non-streaming run such as a capability probe.
#[derive(Debug, Clone)]
pub struct CapturedRun {
    pub code: Option<i32>,
    pub stderr: String,
    pub timed_out: bool,
}

impl CapturedRun {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run FFmpeg with stderr captured, killing it if it outlives `timeout`.
pub async fn run_ffmpeg_captured(
    ffmpeg: &Path,
    args: &[String],
    timeout: Duration,
) -> Result<CapturedRun, AppError> {
    let child = spawn(ffmpeg, args, false)?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(CapturedRun {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: false,
            })
        }
        // Dropping the future drops the child, which kills it.
        Err(_) => Ok(CapturedRun {
            code: None,
            stderr: String::new(),
            timed_out: true,
        }),
    }
}
