//! Process-wide table of encoder and hardware-decoder probe results.
//!
//! Each entry comes from a tiny synthetic transcode. Results stay cached until
//! an explicit re-probe; probes of the same key are serialised so two callers
//! never initialise the same hardware concurrently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinSet;

use crate::codec::{ENCODERS, EncoderSpec, HWACCELS, HwAccel, find_encoder};
use crate::config::EngineConfig;
use crate::ffmpeg::{
    build_decode_probe_args, build_encoder_probe_args, build_probe_clip_args, path_to_string,
    run_ffmpeg_captured,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityEntry {
    pub name: String,
    pub passed: bool,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub probed_at: OffsetDateTime,
}

impl CapabilityEntry {
    pub fn new(name: &str, passed: bool, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed,
            message: message.into(),
            probed_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Something that can be probed. Its key names the table entry.
#[derive(Debug, Clone, Copy)]
pub enum ProbeTarget {
    Encoder(&'static EncoderSpec),
    Decoder(HwAccel),
}

impl ProbeTarget {
    pub fn key(&self) -> String {
        match self {
            ProbeTarget::Encoder(e) => e.name.to_string(),
            ProbeTarget::Decoder(h) => h.probe_key(),
        }
    }

    /// `libx264`, `h264_nvenc`, ... or `hwaccel:cuda`.
    pub fn from_key(key: &str) -> Option<Self> {
        find_encoder(key)
            .map(ProbeTarget::Encoder)
            .or_else(|| HwAccel::from_probe_key(key).map(ProbeTarget::Decoder))
    }

    /// Every encoder and decoder we know about.
    pub fn all() -> Vec<Self> {
        ENCODERS
            .iter()
            .map(ProbeTarget::Encoder)
            .chain(HWACCELS.iter().copied().map(ProbeTarget::Decoder))
            .collect()
    }
}

/// Map FFmpeg stderr from a failed probe to a short reason.
pub fn classify_probe_failure(stderr: &str, name: &str) -> Option<String> {
    let lower = stderr.to_lowercase();
    let reason = if lower.contains("unknown encoder") {
        "Unknown encoder".to_string()
    } else if lower.contains("no nvenc capable devices found") {
        "No NVENC device".to_string()
    } else if lower.contains("operation not permitted") {
        "Operation not permitted".to_string()
    } else if lower.contains("could not open") && lower.contains(&name.to_lowercase()) {
        "Could not open encoder".to_string()
    } else if lower.contains("driver does not support") {
        "Driver doesn't support encoder".to_string()
    } else if lower.contains("no device found") || lower.contains("no device available") {
        "No device found".to_string()
    } else if lower.contains("failed to set value") && lower.contains("init_hw_device") {
        "Hardware device initialization failed".to_string()
    } else if lower.contains("cannot load") {
        let lib = stderr
            .split("Cannot load")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .unwrap_or("unknown");
        format!("Missing library ({})", lib)
    } else if lower.contains("failed to") && lower.contains("encoder") {
        "Encoder init failed".to_string()
    } else if lower.contains("not supported") {
        "Not supported".to_string()
    } else {
        return None;
    };
    Some(reason)
}

pub struct CapabilityTable {
    ffmpeg: PathBuf,
    probe_timeout: Duration,
    vaapi_device: String,
    entries: RwLock<HashMap<String, CapabilityEntry>>,
    /// One async lock per key; held for the whole probe.
    probe_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CapabilityTable {
    pub fn new(ffmpeg: PathBuf, config: &EngineConfig) -> Self {
        Self {
            ffmpeg,
            probe_timeout: config.probe_timeout(),
            vaapi_device: config.vaapi_device.clone(),
            entries: RwLock::new(HashMap::new()),
            probe_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<CapabilityEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Snapshot sorted by name.
    pub fn entries(&self) -> Vec<CapabilityEntry> {
        let mut all: Vec<_> = self.entries.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn record(&self, entry: CapabilityEntry) {
        self.entries.write().insert(entry.name.clone(), entry);
    }

    fn probe_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.probe_locks.lock();
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Cached result, probing first if the key has never been probed.
    pub async fn probe(&self, target: ProbeTarget) -> CapabilityEntry {
        let key = target.key();
        if let Some(entry) = self.get(&key) {
            return entry;
        }
        let lock = self.probe_lock(&key);
        let _guard = lock.lock().await;
        // Another caller may have finished while we waited.
        if let Some(entry) = self.get(&key) {
            return entry;
        }
        let entry = self.run_probe(target).await;
        self.record(entry.clone());
        entry
    }

    /// Probe again and replace the cached entry.
    pub async fn reprobe(&self, target: ProbeTarget) -> CapabilityEntry {
        let key = target.key();
        let lock = self.probe_lock(&key);
        let _guard = lock.lock().await;
        let entry = self.run_probe(target).await;
        self.record(entry.clone());
        entry
    }

    /// Probe any targets not yet in the table, concurrently.
    pub async fn ensure_probed(self: &Arc<Self>, targets: &[ProbeTarget]) {
        let mut set = JoinSet::new();
        for target in targets.iter().copied() {
            if self.get(&target.key()).is_some() {
                continue;
            }
            let table = Arc::clone(self);
            set.spawn(async move {
                table.probe(target).await;
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// Startup warm-up: probe every known encoder and decoder.
    pub async fn warm_up(self: &Arc<Self>) -> Vec<CapabilityEntry> {
        self.ensure_probed(&ProbeTarget::all()).await;
        let entries = self.entries();
        let passed: Vec<&str> = entries
            .iter()
            .filter(|e| e.passed)
            .map(|e| e.name.as_str())
            .collect();
        log::info!(
            target: "sizefit::capability",
            "Capability warm-up: {}/{} passed [{}]",
            passed.len(),
            entries.len(),
            passed.join(", ")
        );
        entries
    }

    async fn run_probe(&self, target: ProbeTarget) -> CapabilityEntry {
        let key = target.key();
        let (passed, message) = match target {
            ProbeTarget::Encoder(encoder) => self.probe_encoder(encoder).await,
            ProbeTarget::Decoder(hwaccel) => self.probe_decoder(hwaccel).await,
        };
        if passed {
            log::info!(
                target: "sizefit::capability",
                "Probe {}: PASS",
                key
            );
        } else {
            log::info!(
                target: "sizefit::capability",
                "Probe {}: FAIL ({})",
                key,
                message
            );
        }
        CapabilityEntry::new(&key, passed, message)
    }

    async fn probe_encoder(&self, encoder: &EncoderSpec) -> (bool, String) {
        let dir = match tempfile::Builder::new().prefix("sizefit-probe-").tempdir() {
            Ok(d) => d,
            Err(e) => return (false, format!("Probe scratch dir: {}", e)),
        };
        let output = dir.path().join("probe.mkv");
        let args = build_encoder_probe_args(encoder, &self.vaapi_device, &path_to_string(&output));
        let run = match run_ffmpeg_captured(&self.ffmpeg, &args, self.probe_timeout).await {
            Ok(run) => run,
            Err(e) => return (false, e.to_string()),
        };
        if run.timed_out {
            return (false, "Probe timed out".to_string());
        }
        let size = std::fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
        if run.success() && size > 0 {
            return (true, "OK".to_string());
        }
        let message = classify_probe_failure(&run.stderr, encoder.name).unwrap_or_else(|| {
            if run.success() {
                "Encoder produced no output".to_string()
            } else {
                format!("Exit code {}", run.code.unwrap_or(-1))
            }
        });
        (false, message)
    }

    async fn probe_decoder(&self, hwaccel: HwAccel) -> (bool, String) {
        let dir = match tempfile::Builder::new().prefix("sizefit-probe-").tempdir() {
            Ok(d) => d,
            Err(e) => return (false, format!("Probe scratch dir: {}", e)),
        };
        let clip = dir.path().join("clip.mp4");
        let clip_str = path_to_string(&clip);
        let created = run_ffmpeg_captured(&self.ffmpeg, &build_probe_clip_args(&clip_str), self.probe_timeout)
            .await
            .map(|run| run.success())
            .unwrap_or(false);
        if !created || std::fs::metadata(&clip).map(|m| m.len()).unwrap_or(0) == 0 {
            return (false, "Could not create probe clip".to_string());
        }
        let args = build_decode_probe_args(hwaccel, &self.vaapi_device, &clip_str);
        let run = match run_ffmpeg_captured(&self.ffmpeg, &args, self.probe_timeout).await {
            Ok(run) => run,
            Err(e) => return (false, e.to_string()),
        };
        if run.timed_out {
            return (false, "Decode timeout".to_string());
        }
        let lower = run.stderr.to_lowercase();
        if lower.contains("no device found") || lower.contains("cannot load") {
            return (false, "Hardware decode failed".to_string());
        }
        if !run.success() {
            let message = classify_probe_failure(&run.stderr, hwaccel.as_str())
                .unwrap_or_else(|| format!("Decode error (code {})", run.code.unwrap_or(-1)));
            return (false, message);
        }
        (true, "Decode OK".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_failures() {
        assert_eq!(
            classify_probe_failure("[h264_nvenc] No NVENC capable devices found", "h264_nvenc"),
            Some("No NVENC device".to_string())
        );
        assert_eq!(
            classify_probe_failure("Unknown encoder 'av1_amf'", "av1_amf"),
            Some("Unknown encoder".to_string())
        );
        assert_eq!(
            classify_probe_failure("Cannot load libcuda.so.1\n", "h264_nvenc"),
            Some("Missing library (libcuda.so.1)".to_string())
        );
        assert_eq!(classify_probe_failure("all fine", "libx264"), None);
    }

    #[test]
    fn probe_target_keys() {
        assert!(matches!(
            ProbeTarget::from_key("hevc_qsv"),
            Some(ProbeTarget::Encoder(e)) if e.name == "hevc_qsv"
        ));
        assert!(matches!(
            ProbeTarget::from_key("hwaccel:vaapi"),
            Some(ProbeTarget::Decoder(HwAccel::Vaapi))
        ));
        assert!(ProbeTarget::from_key("prores_ks").is_none());
        assert_eq!(ProbeTarget::all().len(), ENCODERS.len() + HWACCELS.len());
    }

    #[tokio::test]
    async fn cached_entry_is_returned_without_probing() {
        let table = CapabilityTable::new(
            PathBuf::from("/definitely/not/ffmpeg"),
            &EngineConfig::default(),
        );
        let seeded = CapabilityEntry::new("libx264", true, "OK");
        table.record(seeded.clone());
        let target = ProbeTarget::from_key("libx264").expect("known");
        assert_eq!(table.probe(target).await, seeded);
    }

    #[tokio::test]
    async fn missing_ffmpeg_records_failure() {
        let table = CapabilityTable::new(
            PathBuf::from("/definitely/not/ffmpeg"),
            &EngineConfig::default(),
        );
        let target = ProbeTarget::from_key("libx265").expect("known");
        let entry = table.probe(target).await;
        assert!(!entry.passed);
        assert!(entry.message.contains("Failed to spawn FFmpeg"));
        assert_eq!(table.get("libx265"), Some(entry));
    }
}
