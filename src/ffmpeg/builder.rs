use crate::codec::{
    AudioCodec, Container, DecoderChoice, EncoderSpec, HwAccel, encoder_flags, hw_init_args,
    preset_args, upload_filter,
};

/// Synthetic source used by every probe.
const PROBE_SOURCE: &str = "color=black:s=256x256:d=0.1";

/// Everything one attempt's command line depends on.
#[derive(Debug, Clone)]
pub struct TranscodeParams<'a> {
    pub input: &'a str,
    pub output: &'a str,
    pub encoder: &'static EncoderSpec,
    pub decoder: DecoderChoice,
    pub video_kbps: f64,
    /// None mutes the output.
    pub audio: Option<(AudioCodec, u32)>,
    pub container: Container,
    pub preset: &'a str,
    pub tune: &'a str,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub start_time: Option<&'a str>,
    pub end_time: Option<&'a str>,
    pub vaapi_device: &'a str,
}

/// Seconds, `MM:SS` or `HH:MM:SS` (fractional seconds allowed).
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let parts: Vec<&str> = value.split(':').collect();
    let secs = match parts.as_slice() {
        [s] => s.parse::<f64>().ok()?,
        [m, s] => m.parse::<u32>().ok()? as f64 * 60.0 + s.parse::<f64>().ok()?,
        [h, m, s] => {
            h.parse::<u32>().ok()? as f64 * 3600.0
                + m.parse::<u32>().ok()? as f64 * 60.0
                + s.parse::<f64>().ok()?
        }
        _ => return None,
    };
    (secs.is_finite() && secs >= 0.0).then_some(secs)
}

/// Length of the span that will actually be encoded.
pub fn trimmed_duration(source_secs: f64, start_time: Option<&str>, end_time: Option<&str>) -> f64 {
    let start = start_time
        .and_then(parse_timestamp)
        .unwrap_or(0.0)
        .clamp(0.0, source_secs.max(0.0));
    let end = end_time
        .and_then(parse_timestamp)
        .filter(|e| *e > start)
        .unwrap_or(source_secs)
        .min(source_secs);
    (end - start).max(0.0)
}

fn scale_filter(max_width: Option<u32>, max_height: Option<u32>) -> Option<String> {
    match (max_width, max_height) {
        (Some(w), Some(h)) => Some(format!(
            "scale='min(iw,{w})':'min(ih,{h})':force_original_aspect_ratio=decrease:force_divisible_by=2"
        )),
        (Some(w), None) => Some(format!("scale='min(iw,{w})':-2")),
        (None, Some(h)) => Some(format!("scale=-2:'min(ih,{h})'")),
        (None, None) => None,
    }
}

fn trim_output_args(start_time: Option<&str>, end_time: Option<&str>) -> Vec<String> {
    let Some(end) = end_time.filter(|e| !e.trim().is_empty()) else {
        return vec![];
    };
    match start_time.filter(|s| !s.trim().is_empty()) {
        Some(start) => match (parse_timestamp(start), parse_timestamp(end)) {
            (Some(s), Some(e)) if e > s => vec!["-t".into(), format!("{:.3}", e - s)],
            _ => {
                log::warn!(
                    target: "sizefit::ffmpeg::builder",
                    "Ignoring trim end {:?}: not after start {:?}",
                    end,
                    start
                );
                vec![]
            }
        },
        None => vec!["-to".into(), end.trim().to_string()],
    }
}

pub fn build_transcode_args(p: &TranscodeParams<'_>) -> Vec<String> {
    let video_kbps = p.video_kbps.max(1.0);
    let maxrate = (video_kbps * 1.2) as u64;
    let bufsize = (video_kbps * 2.0) as u64;

    log::debug!(
        target: "sizefit::ffmpeg::builder",
        "Building FFmpeg command: encoder={}, decoder={}, video={:.0}k, input={} -> output={}",
        p.encoder.name,
        p.decoder.describe(),
        video_kbps,
        p.input,
        p.output
    );

    let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into(), "-y".into()];
    args.extend(hw_init_args(p.encoder, p.vaapi_device));
    args.extend(p.decoder.input_args());
    if let Some(start) = p.start_time.filter(|s| !s.trim().is_empty()) {
        args.extend(["-ss".into(), start.trim().to_string()]);
    }
    args.extend(["-i".into(), p.input.to_string()]);
    args.extend(trim_output_args(p.start_time, p.end_time));

    args.extend(["-c:v".into(), p.encoder.name.to_string()]);
    args.extend(encoder_flags(p.encoder, p.container));

    let filters: Vec<String> = scale_filter(p.max_width, p.max_height)
        .into_iter()
        .chain(upload_filter(p.encoder).map(str::to_string))
        .collect();
    if !filters.is_empty() {
        args.extend(["-vf".into(), filters.join(",")]);
    }

    args.extend([
        "-b:v".into(),
        format!("{}k", video_kbps as u64),
        "-maxrate".into(),
        format!("{}k", maxrate),
        "-bufsize".into(),
        format!("{}k", bufsize),
    ]);
    args.extend(preset_args(p.encoder, p.preset, p.tune));

    match p.audio {
        Some((codec, kbps)) if codec != AudioCodec::None && kbps > 0 => {
            args.extend([
                "-c:a".into(),
                codec.as_str().to_string(),
                "-b:a".into(),
                format!("{}k", kbps),
            ]);
        }
        _ => args.push("-an".into()),
    }

    if p.container == Container::Mp4 {
        args.extend(["-movflags".into(), "+faststart".into()]);
    }
    args.extend([
        "-progress".into(),
        "pipe:1".into(),
        "-nostats".into(),
        p.output.to_string(),
    ]);
    args
}

/// Encode a few synthetic frames with `encoder` into `output`.
pub fn build_encoder_probe_args(encoder: &EncoderSpec, vaapi_device: &str, output: &str) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into(), "-y".into()];
    args.extend(hw_init_args(encoder, vaapi_device));
    args.extend([
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        PROBE_SOURCE.into(),
        "-c:v".into(),
        encoder.name.to_string(),
    ]);
    args.extend(encoder_flags(encoder, Container::Mkv));
    if let Some(filter) = upload_filter(encoder) {
        args.extend(["-vf".into(), filter.to_string()]);
    }
    args.extend(["-frames:v".into(), "3".into(), output.to_string()]);
    args
}

/// Short software-encoded clip for decode probes.
pub fn build_probe_clip_args(output: &str) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-nostdin".into(),
        "-y".into(),
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        PROBE_SOURCE.into(),
        "-c:v".into(),
        "libx264".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-frames:v".into(),
        "3".into(),
        output.to_string(),
    ]
}

/// Decode `input` through `hwaccel`, discarding frames.
pub fn build_decode_probe_args(hwaccel: HwAccel, vaapi_device: &str, input: &str) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into()];
    args.extend(hwaccel.init_args(vaapi_device));
    args.extend(hwaccel.decode_args());
    args.extend([
        "-i".into(),
        input.to_string(),
        "-f".into(),
        "null".into(),
        "-".into(),
    ]);
    args
}

/// One line, arguments with spaces quoted. For log events.
pub fn format_args_for_display(args: &[String]) -> String {
    args.iter()
        .map(|a| {
            if a.contains(' ') || a.contains('|') {
                format!("\"{}\"", a)
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::find_encoder;

    fn params_with(encoder: &str, f: impl FnOnce(&mut TranscodeParams<'static>)) -> Vec<String> {
        let mut p = TranscodeParams {
            input: "/in/source.mov",
            output: "/out/result.mp4",
            encoder: find_encoder(encoder).expect("known encoder"),
            decoder: DecoderChoice::Auto,
            video_kbps: 1237.33,
            audio: Some((AudioCodec::Aac, 128)),
            container: Container::Mp4,
            preset: "p6",
            tune: "hq",
            max_width: None,
            max_height: None,
            start_time: None,
            end_time: None,
            vaapi_device: "/dev/dri/renderD128",
        };
        f(&mut p);
        build_transcode_args(&p)
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn rate_control_flags() {
        let args = params_with("libx264", |_| {});
        assert_eq!(value_after(&args, "-b:v"), Some("1237k"));
        assert_eq!(value_after(&args, "-maxrate"), Some("1484k"));
        assert_eq!(value_after(&args, "-bufsize"), Some("2474k"));
        assert_eq!(value_after(&args, "-c:a"), Some("aac"));
        assert_eq!(value_after(&args, "-b:a"), Some("128k"));
        assert_eq!(value_after(&args, "-progress"), Some("pipe:1"));
        assert_eq!(value_after(&args, "-movflags"), Some("+faststart"));
        assert_eq!(args.last().map(String::as_str), Some("/out/result.mp4"));
    }

    #[test]
    fn muted_audio_and_mkv() {
        let args = params_with("libx265", |p| {
            p.audio = None;
            p.container = Container::Mkv;
            p.output = "/out/result.mkv";
        });
        assert!(args.contains(&"-an".to_string()));
        assert!(!args.contains(&"-movflags".to_string()));
        assert!(!args.contains(&"hvc1".to_string()));
    }

    #[test]
    fn vaapi_scale_precedes_upload() {
        let args = params_with("h264_vaapi", |p| p.max_width = Some(1280));
        assert_eq!(
            value_after(&args, "-vf"),
            Some("scale='min(iw,1280)':-2,format=nv12|vaapi,hwupload")
        );
        assert_eq!(
            value_after(&args, "-init_hw_device"),
            Some("vaapi=va:/dev/dri/renderD128")
        );
        let init = args.iter().position(|a| a == "-init_hw_device").expect("init");
        let input = args.iter().position(|a| a == "-i").expect("input");
        assert!(init < input);
    }

    #[test]
    fn trim_with_start_and_end_uses_duration() {
        let args = params_with("libx264", |p| {
            p.start_time = Some("00:00:10");
            p.end_time = Some("25.5");
        });
        let ss = args.iter().position(|a| a == "-ss").expect("-ss");
        let input = args.iter().position(|a| a == "-i").expect("-i");
        assert!(ss < input);
        assert_eq!(value_after(&args, "-t"), Some("15.500"));
        assert!(!args.contains(&"-to".to_string()));
    }

    #[test]
    fn trim_end_only_uses_to() {
        let args = params_with("libx264", |p| p.end_time = Some("01:30"));
        assert_eq!(value_after(&args, "-to"), Some("01:30"));
        assert!(!args.contains(&"-ss".to_string()));
    }

    #[test]
    fn decoder_args_precede_input() {
        let args = params_with("libx264", |p| p.decoder = DecoderChoice::Libdav1d);
        let dav1d = args.iter().position(|a| a == "libdav1d").expect("libdav1d");
        let input = args.iter().position(|a| a == "-i").expect("-i");
        assert!(dav1d < input);
    }

    #[test]
    fn timestamps_parse() {
        assert_eq!(parse_timestamp("90"), Some(90.0));
        assert_eq!(parse_timestamp("01:30"), Some(90.0));
        assert_eq!(parse_timestamp("01:00:01.5"), Some(3601.5));
        assert_eq!(parse_timestamp("abc"), None);
        assert_eq!(parse_timestamp("-5"), None);
    }

    #[test]
    fn trimmed_duration_clamps() {
        assert_eq!(trimmed_duration(60.0, None, None), 60.0);
        assert_eq!(trimmed_duration(60.0, Some("10"), Some("40")), 30.0);
        assert_eq!(trimmed_duration(60.0, Some("10"), None), 50.0);
        assert_eq!(trimmed_duration(60.0, None, Some("90")), 60.0);
        assert_eq!(trimmed_duration(60.0, Some("70"), None), 0.0);
    }

    #[test]
    fn encoder_probe_uses_synthetic_source() {
        let enc = find_encoder("hevc_qsv").expect("known");
        let args = build_encoder_probe_args(enc, "/dev/dri/renderD128", "/tmp/p.mkv");
        assert_eq!(value_after(&args, "-i"), Some(PROBE_SOURCE));
        assert_eq!(value_after(&args, "-c:v"), Some("hevc_qsv"));
        assert_eq!(value_after(&args, "-init_hw_device"), Some("qsv=hw"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/p.mkv"));
    }

    #[test]
    fn decode_probe_discards_output() {
        let args = build_decode_probe_args(HwAccel::Cuda, "/dev/dri/renderD128", "/tmp/c.mp4");
        assert_eq!(value_after(&args, "-hwaccel"), Some("cuda"));
        assert_eq!(value_after(&args, "-f"), Some("null"));
    }
}
