//! Encoder families, fallback chains and per-backend FFmpeg flags.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capability::CapabilityTable;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecFamily {
    H264,
    Hevc,
    Av1,
}

impl CodecFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            CodecFamily::H264 => "h264",
            CodecFamily::Hevc => "hevc",
            CodecFamily::Av1 => "av1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Nvenc,
    Qsv,
    Vaapi,
    Amf,
    Software,
}

impl Backend {
    pub fn is_hardware(self) -> bool {
        self != Backend::Software
    }
}

/// One concrete encoder. The name doubles as its capability key.
#[derive(Debug, PartialEq, Eq)]
pub struct EncoderSpec {
    pub name: &'static str,
    pub family: CodecFamily,
    pub backend: Backend,
}

macro_rules! encoder_table {
    ( $( [$name:expr, $family:ident, $backend:ident] ),* $(,)? ) => {
        /// Every encoder we know how to drive, in fallback order within each family.
        pub const ENCODERS: &[EncoderSpec] = &[
            $( EncoderSpec {
                name: $name,
                family: CodecFamily::$family,
                backend: Backend::$backend,
            } ),*
        ];
    };
}

encoder_table!(
    ["h264_nvenc", H264, Nvenc],
    ["h264_qsv", H264, Qsv],
    ["h264_vaapi", H264, Vaapi],
    ["h264_amf", H264, Amf],
    ["libx264", H264, Software],
    ["hevc_nvenc", Hevc, Nvenc],
    ["hevc_qsv", Hevc, Qsv],
    ["hevc_vaapi", Hevc, Vaapi],
    ["hevc_amf", Hevc, Amf],
    ["libx265", Hevc, Software],
    ["av1_nvenc", Av1, Nvenc],
    ["av1_qsv", Av1, Qsv],
    ["av1_vaapi", Av1, Vaapi],
    ["av1_amf", Av1, Amf],
    ["libsvtav1", Av1, Software],
    ["libaom-av1", Av1, Software],
);

pub fn find_encoder(name: &str) -> Option<&'static EncoderSpec> {
    ENCODERS.iter().find(|e| e.name == name)
}

/// Default chain for a family: hardware vendors first, software last.
pub fn family_chain(family: CodecFamily) -> Vec<&'static EncoderSpec> {
    ENCODERS.iter().filter(|e| e.family == family).collect()
}

/// A parsed codec request: either a bare family or a concrete encoder name.
#[derive(Debug, Clone)]
pub struct CodecRequest {
    pub raw: String,
    pub family: CodecFamily,
    pub preferred: Option<&'static EncoderSpec>,
}

impl CodecRequest {
    pub fn parse(raw: &str) -> Self {
        let lower = raw.trim().to_lowercase();
        if let Some(spec) = find_encoder(&lower) {
            return Self {
                raw: raw.to_string(),
                family: spec.family,
                preferred: Some(spec),
            };
        }
        let family = if lower.contains("h264") || lower == "avc" || lower.contains("x264") {
            CodecFamily::H264
        } else if lower.contains("hevc") || lower.contains("h265") || lower.contains("x265") {
            CodecFamily::Hevc
        } else if lower.contains("av1") {
            CodecFamily::Av1
        } else {
            log::warn!(
                target: "sizefit::codec",
                "Unknown codec '{}', using h264",
                raw
            );
            CodecFamily::H264
        };
        Self {
            raw: raw.to_string(),
            family,
            preferred: None,
        }
    }

    /// Fallback chain for this request, the explicitly named encoder first.
    pub fn chain(&self) -> Vec<&'static EncoderSpec> {
        let mut chain = family_chain(self.family);
        if let Some(preferred) = self.preferred {
            chain.retain(|e| e.name != preferred.name);
            chain.insert(0, preferred);
        }
        chain
    }
}

/// Picks the first encoder in a chain whose probe passed.
pub struct EncoderResolver {
    table: Arc<CapabilityTable>,
}

impl EncoderResolver {
    pub fn new(table: Arc<CapabilityTable>) -> Self {
        Self { table }
    }

    /// Entries that are missing or failed are skipped. Only an exhausted chain is an error.
    pub fn resolve(&self, request: &CodecRequest) -> Result<&'static EncoderSpec, AppError> {
        for candidate in request.chain() {
            match self.table.get(candidate.name) {
                Some(entry) if entry.passed => {
                    log::info!(
                        target: "sizefit::codec",
                        "Resolved encoder: requested={}, actual={}",
                        request.raw,
                        candidate.name
                    );
                    return Ok(candidate);
                }
                Some(entry) => log::debug!(
                    target: "sizefit::codec",
                    "Skipping {}: {}",
                    candidate.name,
                    entry.message
                ),
                None => log::debug!(
                    target: "sizefit::codec",
                    "Skipping {}: not probed",
                    candidate.name
                ),
            }
        }
        log::warn!(
            target: "sizefit::codec",
            "No working encoder for '{}'",
            request.raw
        );
        Err(AppError::NoEncoderAvailable {
            requested: request.raw.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    Mp4,
    Mkv,
}

impl Container {
    pub fn extension(self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    #[default]
    Aac,
    Libopus,
    None,
}

impl AudioCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Libopus => "libopus",
            AudioCodec::None => "none",
        }
    }
}

/// Opus in mp4 is poorly supported by players, so it becomes AAC there.
/// Returns the codec to use and whether it was switched.
pub fn effective_audio_codec(codec: AudioCodec, container: Container) -> (AudioCodec, bool) {
    match (codec, container) {
        (AudioCodec::Libopus, Container::Mp4) => (AudioCodec::Aac, true),
        (c, _) => (c, false),
    }
}

/// Hardware decode paths. The probe key is `hwaccel:<name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    Cuda,
    Qsv,
    Vaapi,
}

pub const HWACCELS: &[HwAccel] = &[HwAccel::Cuda, HwAccel::Qsv, HwAccel::Vaapi];

impl HwAccel {
    pub fn as_str(self) -> &'static str {
        match self {
            HwAccel::Cuda => "cuda",
            HwAccel::Qsv => "qsv",
            HwAccel::Vaapi => "vaapi",
        }
    }

    pub fn probe_key(self) -> String {
        format!("hwaccel:{}", self.as_str())
    }

    pub fn from_probe_key(key: &str) -> Option<Self> {
        let name = key.strip_prefix("hwaccel:")?;
        HWACCELS.iter().copied().find(|h| h.as_str() == name)
    }

    /// Input options selecting this decoder. Device init comes from the encoder flags.
    pub fn decode_args(self) -> Vec<String> {
        match self {
            HwAccel::Cuda => vec!["-hwaccel".into(), "cuda".into()],
            HwAccel::Qsv => vec!["-hwaccel".into(), "qsv".into()],
            HwAccel::Vaapi => vec![
                "-hwaccel".into(),
                "vaapi".into(),
                "-hwaccel_device".into(),
                "va".into(),
            ],
        }
    }

    /// Device init a standalone decode needs.
    pub fn init_args(self, vaapi_device: &str) -> Vec<String> {
        match self {
            HwAccel::Cuda => vec![],
            HwAccel::Qsv => vec!["-init_hw_device".into(), "qsv=hw".into()],
            HwAccel::Vaapi => vec![
                "-init_hw_device".into(),
                format!("vaapi=va:{}", vaapi_device),
            ],
        }
    }

    /// The decode path that pairs with an encoder backend for a given source codec.
    pub fn for_backend(backend: Backend, source_codec: Option<&str>) -> Option<Self> {
        match backend {
            Backend::Nvenc => match source_codec {
                Some("h264") | Some("hevc") => Some(HwAccel::Cuda),
                _ => None,
            },
            Backend::Qsv => Some(HwAccel::Qsv),
            Backend::Vaapi => Some(HwAccel::Vaapi),
            Backend::Amf | Backend::Software => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "name")]
pub enum DecoderChoice {
    Auto,
    Libdav1d,
    HwAccel(HwAccel),
}

impl DecoderChoice {
    pub fn input_args(self) -> Vec<String> {
        match self {
            DecoderChoice::Auto => vec![],
            DecoderChoice::Libdav1d => vec!["-c:v".into(), "libdav1d".into()],
            DecoderChoice::HwAccel(h) => h.decode_args(),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            DecoderChoice::Auto => "auto",
            DecoderChoice::Libdav1d => "libdav1d",
            DecoderChoice::HwAccel(h) => h.as_str(),
        }
    }
}

/// AV1 input always goes through libdav1d. Otherwise a hardware path is used
/// only when asked for and its decode probe passed.
pub fn choose_decoder(
    source_codec: Option<&str>,
    encoder: &EncoderSpec,
    prefer_hw_decode: bool,
    hwaccel_passed: impl Fn(HwAccel) -> bool,
) -> DecoderChoice {
    if source_codec == Some("av1") {
        return DecoderChoice::Libdav1d;
    }
    if !prefer_hw_decode {
        return DecoderChoice::Auto;
    }
    match HwAccel::for_backend(encoder.backend, source_codec) {
        Some(h) if hwaccel_passed(h) => DecoderChoice::HwAccel(h),
        _ => DecoderChoice::Auto,
    }
}

/// Global options that must precede the input for hardware encoders.
pub fn hw_init_args(encoder: &EncoderSpec, vaapi_device: &str) -> Vec<String> {
    match encoder.backend {
        Backend::Qsv => vec![
            "-init_hw_device".into(),
            "qsv=hw".into(),
            "-filter_hw_device".into(),
            "hw".into(),
        ],
        Backend::Vaapi => vec![
            "-init_hw_device".into(),
            format!("vaapi=va:{}", vaapi_device),
            "-filter_hw_device".into(),
            "va".into(),
        ],
        _ => vec![],
    }
}

/// Filter that moves frames onto the device, appended after any scaling.
pub fn upload_filter(encoder: &EncoderSpec) -> Option<&'static str> {
    match encoder.backend {
        Backend::Vaapi => Some("format=nv12|vaapi,hwupload"),
        _ => None,
    }
}

/// Pixel format, profile and container tag flags.
pub fn encoder_flags(encoder: &EncoderSpec, container: Container) -> Vec<String> {
    let mut flags: Vec<String> = Vec::new();
    match encoder.backend {
        Backend::Nvenc | Backend::Amf | Backend::Software => {
            flags.extend(["-pix_fmt".into(), "yuv420p".into()]);
        }
        Backend::Qsv => flags.extend(["-pix_fmt".into(), "nv12".into()]),
        Backend::Vaapi => {}
    }
    match (encoder.family, encoder.backend) {
        (CodecFamily::H264, Backend::Vaapi) => {}
        (CodecFamily::H264, _) => flags.extend(["-profile:v".into(), "high".into()]),
        (CodecFamily::Hevc, Backend::Nvenc) => flags.extend(["-profile:v".into(), "main".into()]),
        _ => {}
    }
    if container == Container::Mp4 {
        match encoder.family {
            CodecFamily::Hevc => flags.extend(["-tag:v".into(), "hvc1".into()]),
            CodecFamily::Av1 => flags.extend(["-tag:v".into(), "av01".into()]),
            CodecFamily::H264 => {}
        }
    }
    flags
}

const QSV_PRESETS: [&str; 7] = ["veryfast", "faster", "fast", "medium", "slow", "slower", "veryslow"];
const AMF_QUALITY: [&str; 7] = ["speed", "speed", "balanced", "balanced", "quality", "quality", "quality"];
const CPU_PRESETS: [&str; 7] = ["ultrafast", "superfast", "veryfast", "faster", "fast", "medium", "slow"];
/// libsvtav1 preset 0-13, higher is faster. Indexed like CPU_PRESETS.
const SVTAV1_PRESETS: [&str; 7] = ["12", "11", "10", "9", "8", "6", "4"];
const NVENC_TUNES: &[&str] = &["hq", "ll", "ull", "lossless"];

/// `p1`..`p7`, slowest last. Anything else is treated as p6.
pub fn preset_level(preset: &str) -> usize {
    preset
        .trim()
        .to_lowercase()
        .strip_prefix('p')
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| (1..=7).contains(n))
        .unwrap_or(6)
}

/// Speed/quality flags for the chosen encoder.
pub fn preset_args(encoder: &EncoderSpec, preset: &str, tune: &str) -> Vec<String> {
    let level = preset_level(preset);
    let idx = level - 1;
    match (encoder.backend, encoder.name) {
        (Backend::Nvenc, _) => {
            let mut args = vec!["-preset".to_string(), format!("p{}", level)];
            let tune = tune.trim().to_lowercase();
            if NVENC_TUNES.contains(&tune.as_str()) {
                args.extend(["-tune".to_string(), tune]);
            }
            args
        }
        (Backend::Qsv, _) => vec!["-preset".into(), QSV_PRESETS[idx].into()],
        (Backend::Amf, _) => vec!["-quality".into(), AMF_QUALITY[idx].into()],
        (Backend::Vaapi, _) => vec!["-compression_level".into(), level.to_string()],
        (Backend::Software, "libx264") => vec![
            "-preset".into(),
            CPU_PRESETS[idx].into(),
            "-tune".into(),
            "film".into(),
        ],
        (Backend::Software, "libsvtav1") => vec!["-preset".into(), SVTAV1_PRESETS[idx].into()],
        (Backend::Software, "libaom-av1") => vec![
            "-cpu-used".into(),
            (9 - level).to_string(),
            "-row-mt".into(),
            "1".into(),
        ],
        (Backend::Software, _) => vec!["-preset".into(), CPU_PRESETS[idx].into()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityEntry;
    use std::path::PathBuf;

    fn table_with(results: &[(&str, bool)]) -> Arc<CapabilityTable> {
        let table = CapabilityTable::new(PathBuf::from("/nonexistent/ffmpeg"), &Default::default());
        for (name, passed) in results {
            table.record(CapabilityEntry::new(
                name,
                *passed,
                if *passed { "OK" } else { "No device found" },
            ));
        }
        Arc::new(table)
    }

    fn names(chain: &[&'static EncoderSpec]) -> Vec<&'static str> {
        chain.iter().map(|e| e.name).collect()
    }

    #[test]
    fn bare_family_uses_default_chain() {
        let req = CodecRequest::parse("hevc");
        assert_eq!(req.family, CodecFamily::Hevc);
        assert_eq!(
            names(&req.chain()),
            vec!["hevc_nvenc", "hevc_qsv", "hevc_vaapi", "hevc_amf", "libx265"]
        );
    }

    #[test]
    fn explicit_encoder_goes_first() {
        let req = CodecRequest::parse("h264_vaapi");
        assert_eq!(
            names(&req.chain()),
            vec!["h264_vaapi", "h264_nvenc", "h264_qsv", "h264_amf", "libx264"]
        );
    }

    #[test]
    fn h265_alias_and_unknown_default() {
        assert_eq!(CodecRequest::parse("H265").family, CodecFamily::Hevc);
        assert_eq!(CodecRequest::parse("mpeg2").family, CodecFamily::H264);
    }

    #[test]
    fn av1_chain_ends_with_both_software_encoders() {
        let chain = family_chain(CodecFamily::Av1);
        assert_eq!(names(&chain[chain.len() - 2..]), vec!["libsvtav1", "libaom-av1"]);
    }

    #[test]
    fn resolver_skips_failed_and_unknown() {
        let table = table_with(&[("av1_nvenc", false), ("libsvtav1", true)]);
        let resolver = EncoderResolver::new(table);
        let chosen = resolver.resolve(&CodecRequest::parse("av1")).expect("resolve");
        assert_eq!(chosen.name, "libsvtav1");
    }

    #[test]
    fn resolver_falls_back_to_software_when_hardware_fails() {
        let table = table_with(&[("h264_nvenc", false), ("libx264", true)]);
        let resolver = EncoderResolver::new(table);
        let chosen = resolver
            .resolve(&CodecRequest::parse("h264_nvenc"))
            .expect("resolve");
        assert_eq!(chosen.name, "libx264");
    }

    #[test]
    fn resolver_errors_when_chain_exhausted() {
        let table = table_with(&[("libx265", false)]);
        let resolver = EncoderResolver::new(table);
        let err = resolver
            .resolve(&CodecRequest::parse("hevc"))
            .expect_err("nothing passes");
        match err {
            AppError::NoEncoderAvailable { requested } => assert_eq!(requested, "hevc"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn resolver_never_errors_when_some_entry_passed() {
        for encoder in ENCODERS {
            let table = table_with(&[(encoder.name, true)]);
            let resolver = EncoderResolver::new(table);
            let req = CodecRequest::parse(encoder.family.as_str());
            assert_eq!(resolver.resolve(&req).expect("resolve").name, encoder.name);
        }
    }

    #[test]
    fn preset_mapping_per_backend() {
        let nvenc = find_encoder("h264_nvenc").expect("known");
        assert_eq!(preset_args(nvenc, "p4", "hq"), vec!["-preset", "p4", "-tune", "hq"]);
        let qsv = find_encoder("hevc_qsv").expect("known");
        assert_eq!(preset_args(qsv, "p7", "hq"), vec!["-preset", "veryslow"]);
        let amf = find_encoder("h264_amf").expect("known");
        assert_eq!(preset_args(amf, "p1", ""), vec!["-quality", "speed"]);
        let x264 = find_encoder("libx264").expect("known");
        assert_eq!(
            preset_args(x264, "bogus", "hq"),
            vec!["-preset", "medium", "-tune", "film"]
        );
        let svt = find_encoder("libsvtav1").expect("known");
        assert_eq!(preset_args(svt, "p5", ""), vec!["-preset", "8"]);
    }

    #[test]
    fn opus_in_mp4_becomes_aac() {
        assert_eq!(
            effective_audio_codec(AudioCodec::Libopus, Container::Mp4),
            (AudioCodec::Aac, true)
        );
        assert_eq!(
            effective_audio_codec(AudioCodec::Libopus, Container::Mkv),
            (AudioCodec::Libopus, false)
        );
    }

    #[test]
    fn decoder_choice_rules() {
        let nvenc = find_encoder("h264_nvenc").expect("known");
        let x264 = find_encoder("libx264").expect("known");
        assert_eq!(
            choose_decoder(Some("av1"), nvenc, true, |_| true),
            DecoderChoice::Libdav1d
        );
        assert_eq!(
            choose_decoder(Some("h264"), nvenc, true, |_| true),
            DecoderChoice::HwAccel(HwAccel::Cuda)
        );
        assert_eq!(
            choose_decoder(Some("h264"), nvenc, true, |_| false),
            DecoderChoice::Auto
        );
        assert_eq!(
            choose_decoder(Some("h264"), nvenc, false, |_| true),
            DecoderChoice::Auto
        );
        assert_eq!(
            choose_decoder(Some("vp9"), nvenc, true, |_| true),
            DecoderChoice::Auto
        );
        assert_eq!(
            choose_decoder(Some("h264"), x264, true, |_| true),
            DecoderChoice::Auto
        );
    }

    #[test]
    fn hwaccel_probe_key_round_trips() {
        for h in HWACCELS {
            assert_eq!(HwAccel::from_probe_key(&h.probe_key()), Some(*h));
        }
        assert_eq!(HwAccel::from_probe_key("libx264"), None);
    }
}
