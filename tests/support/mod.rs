//! Shared helpers for integration tests: a scriptable fake `ffmpeg`.
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sizefit_core::{EngineConfig, JobEvent};
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::RecvError};

pub const MB: u64 = 1024 * 1024;

/// Behaviour is driven by files next to the script:
/// `fail` (encoder names or `hwaccel:<name>` that fail probing), `sizes`
/// (output size per transcode, last line repeats), `steps` and `delay`
/// (progress samples and the pause between them), `exit_codes` (per
/// transcode, last line repeats) or a single `exit_code`.
/// Invocations are appended to `probes.log` and `transcodes.log`.
const SCRIPT: &str = r#"#!/bin/sh
DIR="__DIR__"
enc=""
hw=""
prev=""
for a in "$@"; do
  case "$prev" in
    -c:v) enc="$a" ;;
    -hwaccel) hw="$a" ;;
  esac
  prev="$a"
done
out="$a"

if [ "$out" = "-" ]; then
  echo "hwaccel:$hw" >> "$DIR/probes.log"
  if grep -qx "hwaccel:$hw" "$DIR/fail" 2>/dev/null; then
    echo "No device found" >&2
    exit 1
  fi
  exit 0
fi

case " $* " in
  *" lavfi "*)
    case "$out" in
      *clip.mp4) ;;
      *) echo "$enc" >> "$DIR/probes.log" ;;
    esac
    if grep -qx "$enc" "$DIR/fail" 2>/dev/null; then
      echo "Unknown encoder '$enc'" >&2
      exit 1
    fi
    printf 'probe-output' > "$out"
    exit 0
    ;;
esac

echo "$*" >> "$DIR/transcodes.log"
n=$(($(wc -l < "$DIR/transcodes.log")))
size=$(sed -n "${n}p" "$DIR/sizes" 2>/dev/null)
[ -z "$size" ] && size=$(tail -n 1 "$DIR/sizes" 2>/dev/null)
[ -z "$size" ] && size=1024
steps=$(cat "$DIR/steps" 2>/dev/null || echo 4)
delay=$(cat "$DIR/delay" 2>/dev/null || echo 0)
code=$(sed -n "${n}p" "$DIR/exit_codes" 2>/dev/null)
[ -z "$code" ] && code=$(tail -n 1 "$DIR/exit_codes" 2>/dev/null)
[ -z "$code" ] && code=$(cat "$DIR/exit_code" 2>/dev/null)
[ -z "$code" ] && code=0

echo "Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'source.mp4':" >&2
i=1
while [ "$i" -le "$steps" ]; do
  echo "out_time_us=$((i * 1000000))"
  echo "bitrate=1000.0kbits/s"
  echo "progress=continue"
  sleep "$delay"
  i=$((i + 1))
done

if [ "$code" -ne 0 ]; then
  echo "Error while opening encoder for output stream #0:0" >&2
  exit "$code"
fi
head -c "$size" /dev/zero > "$out"
echo "progress=end"
exit 0
"#;

pub struct FakeFfmpeg {
    dir: TempDir,
    pub path: PathBuf,
}

impl FakeFfmpeg {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ffmpeg");
        let script = SCRIPT.replace("__DIR__", &dir.path().to_string_lossy());
        fs::write(&path, script).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        fs::write(dir.path().join("source.mp4"), b"not really a video").expect("source");
        Self { dir, path }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn source(&self) -> PathBuf {
        self.dir.path().join("source.mp4")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            ffmpeg_path: Some(self.path.clone()),
            output_dir: self.output_dir(),
            cancel_grace_ms: 500,
            probe_timeout_ms: 5_000,
            progress_emit_interval_ms: 0,
            ..EngineConfig::default()
        }
    }

    pub fn fail(&self, names: &[&str]) {
        self.write_lines("fail", names.iter().map(|s| s.to_string()));
    }

    pub fn sizes(&self, sizes: &[u64]) {
        self.write_lines("sizes", sizes.iter().map(|s| s.to_string()));
    }

    /// `steps` one-second progress samples with `delay` between them.
    pub fn pacing(&self, steps: u32, delay: &str) {
        fs::write(self.dir.path().join("steps"), steps.to_string()).expect("steps");
        fs::write(self.dir.path().join("delay"), delay).expect("delay");
    }

    pub fn exit_code(&self, code: i32) {
        fs::write(self.dir.path().join("exit_code"), code.to_string()).expect("exit code");
    }

    /// Exit code per transcode, in order.
    pub fn exit_codes(&self, codes: &[i32]) {
        self.write_lines("exit_codes", codes.iter().map(|c| c.to_string()));
    }

    pub fn probes(&self) -> Vec<String> {
        self.read_lines("probes.log")
    }

    pub fn transcodes(&self) -> Vec<String> {
        self.read_lines("transcodes.log")
    }

    fn write_lines(&self, name: &str, lines: impl Iterator<Item = String>) {
        let body: String = lines.map(|l| l + "\n").collect();
        fs::write(self.dir.path().join(name), body).expect("write");
    }

    fn read_lines(&self, name: &str) -> Vec<String> {
        fs::read_to_string(self.dir.path().join(name))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Value of `flag` in a logged command line, e.g. `-b:v` -> `1237k`.
pub fn arg_after<'a>(command: &'a str, flag: &str) -> Option<&'a str> {
    let mut parts = command.split_whitespace();
    parts.find(|p| *p == flag)?;
    parts.next()
}

/// Drain a job's events until its channel closes.
pub async fn collect_events(mut rx: broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    let drain = async {
        loop {
            match rx.recv().await {
                Ok(event) => events.push(event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), drain)
        .await
        .expect("job did not finish in time");
    events
}

/// Poll until `check` holds or the deadline passes.
pub async fn wait_until(mut check: impl FnMut() -> bool, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

pub fn terminal_events(events: &[JobEvent]) -> Vec<&JobEvent> {
    events.iter().filter(|e| e.is_terminal()).collect()
}

pub fn retry_events(events: &[JobEvent]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Retry { overage_percent } => Some(*overage_percent),
            _ => None,
        })
        .collect()
}
