#![cfg(unix)]

mod support;

use std::path::PathBuf;
use std::sync::Arc;

use serial_test::serial;
use sizefit_core::codec::{CodecRequest, EncoderResolver, find_encoder};
use sizefit_core::{CapabilityTable, Engine, JobSpec, JobState, ProbeTarget, Scheduler};
use support::FakeFfmpeg;

fn table(fake: &FakeFfmpeg) -> Arc<CapabilityTable> {
    Arc::new(CapabilityTable::new(fake.path.clone(), &fake.config()))
}

fn encoder(name: &str) -> ProbeTarget {
    ProbeTarget::Encoder(find_encoder(name).expect("known encoder"))
}

#[tokio::test]
#[serial]
async fn probe_result_is_cached_until_reprobe() {
    let fake = FakeFfmpeg::new();
    let table = table(&fake);

    let first = table.probe(encoder("libx264")).await;
    let second = table.probe(encoder("libx264")).await;
    assert!(first.passed);
    assert_eq!(first, second);
    assert_eq!(fake.probes(), vec!["libx264"]);

    fake.fail(&["libx264"]);
    let refreshed = table.reprobe(encoder("libx264")).await;
    assert!(!refreshed.passed);
    assert_eq!(refreshed.message, "Unknown encoder");
    assert_eq!(fake.probes().len(), 2);
    assert_eq!(table.get("libx264"), Some(refreshed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn concurrent_probes_of_one_encoder_run_once() {
    let fake = FakeFfmpeg::new();
    let table = table(&fake);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let table = Arc::clone(&table);
        handles.push(tokio::spawn(async move {
            table.probe(encoder("hevc_qsv")).await
        }));
    }
    for handle in handles {
        assert!(handle.await.expect("join").passed);
    }
    assert_eq!(fake.probes(), vec!["hevc_qsv"]);
}

#[tokio::test]
#[serial]
async fn missing_ffmpeg_records_failure_instead_of_erroring() {
    let fake = FakeFfmpeg::new();
    let table = Arc::new(CapabilityTable::new(
        PathBuf::from("/nonexistent/ffmpeg"),
        &fake.config(),
    ));
    let entry = table.probe(encoder("libx264")).await;
    assert!(!entry.passed);
    assert!(!entry.message.is_empty());
}

#[tokio::test]
#[serial]
async fn failed_hardware_falls_back_to_software() {
    let fake = FakeFfmpeg::new();
    fake.fail(&["av1_nvenc", "av1_qsv", "av1_vaapi", "av1_amf"]);
    let table = table(&fake);

    let request = CodecRequest::parse("av1");
    let targets: Vec<_> = request.chain().into_iter().map(ProbeTarget::Encoder).collect();
    table.ensure_probed(&targets).await;

    let resolved = EncoderResolver::new(Arc::clone(&table))
        .resolve(&request)
        .expect("software fallback");
    assert_eq!(resolved.name, "libsvtav1");
}

#[tokio::test]
#[serial]
async fn warm_up_covers_encoders_and_decoders() {
    let fake = FakeFfmpeg::new();
    fake.fail(&["hwaccel:cuda", "h264_amf"]);
    let table = table(&fake);

    let entries = table.warm_up().await;
    assert_eq!(entries.len(), ProbeTarget::all().len());
    let by_name = |n: &str| entries.iter().find(|e| e.name == n).expect("entry").passed;
    assert!(!by_name("hwaccel:cuda"));
    assert!(by_name("hwaccel:vaapi"));
    assert!(!by_name("h264_amf"));
    assert!(by_name("libx265"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn job_uses_first_passing_encoder_and_reports_it() {
    let fake = FakeFfmpeg::new();
    fake.fail(&["hevc_nvenc", "hevc_qsv"]);
    fake.sizes(&[400_000]);
    let scheduler = Scheduler::new(Engine::new(fake.config()).expect("engine"));

    let mut spec = JobSpec::new(fake.source(), 1.0, 4.0);
    spec.codec = "hevc".to_string();
    let job = scheduler.submit(spec);
    assert_eq!(job.wait().await, JobState::Completed);

    assert_eq!(job.snapshot().encoder.as_deref(), Some("hevc_vaapi"));
    let command = &fake.transcodes()[0];
    assert!(command.contains("-c:v hevc_vaapi"), "{command}");
    assert!(command.contains("hwupload"), "{command}");
}
