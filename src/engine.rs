//! Drives one admitted job: plan, resolve, encode, check size, maybe retry once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::capability::{CapabilityTable, ProbeTarget};
use crate::codec::{
    AudioCodec, CodecRequest, DecoderChoice, EncoderResolver, EncoderSpec, HwAccel,
    choose_decoder, effective_audio_codec,
};
use crate::config::EngineConfig;
use crate::error::AppError;
use crate::ffmpeg::{
    RunEvent, RunSettings, TranscodeParams, build_transcode_args, format_args_for_display,
    path_to_string, resolve_ffmpeg_path, run_ffmpeg, trimmed_duration,
};
use crate::job::{DoneStats, Job, JobSpec};
use crate::planner::{AudioPolicy, BYTES_PER_MB, BitratePlan, plan};
use crate::retry::{RetryDecision, evaluate, retry_output_path};

/// A finished attempt whose output exists and is non-empty.
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub output_path: PathBuf,
    pub size_bytes: u64,
}

/// Choices fixed for the lifetime of a job. Only the bitrates change between attempts.
struct JobContext {
    encoder: &'static EncoderSpec,
    decoder: DecoderChoice,
    audio_codec: AudioCodec,
    duration_secs: f64,
}

pub struct Engine {
    config: Arc<EngineConfig>,
    ffmpeg: PathBuf,
    capabilities: Arc<CapabilityTable>,
    resolver: EncoderResolver,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!(
            target: "sizefit::engine",
            "Removed partial output {}",
            path.display()
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!(
            target: "sizefit::engine",
            "Failed to remove {}: {}",
            path.display(),
            e
        ),
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, AppError> {
        config.validate()?;
        let ffmpeg = resolve_ffmpeg_path(config.ffmpeg_path.as_deref())?;
        let capabilities = Arc::new(CapabilityTable::new(ffmpeg.clone(), &config));
        log::info!(
            target: "sizefit::engine",
            "Engine ready: ffmpeg={}, slots={}",
            ffmpeg.display(),
            config.max_concurrency
        );
        Ok(Self {
            resolver: EncoderResolver::new(Arc::clone(&capabilities)),
            capabilities,
            ffmpeg,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ffmpeg_path(&self) -> &Path {
        &self.ffmpeg
    }

    pub fn capabilities(&self) -> &Arc<CapabilityTable> {
        &self.capabilities
    }

    /// Run a job that has been admitted and marked running, through to a
    /// terminal state. Never returns an error; failures end up on the job.
    pub async fn run(&self, job: &Job) {
        let started = Instant::now();
        log::info!(
            target: "sizefit::engine",
            "Job {} started: source={}, target={}MB, codec={}",
            job.id(),
            job.spec().source_path.display(),
            job.spec().target_size_mb,
            job.spec().codec
        );
        match self.drive(job, started).await {
            Ok(()) => {}
            Err(AppError::Canceled) => {
                job.log("Job canceled by user");
                job.mark_canceled();
            }
            Err(e) => {
                log::warn!(
                    target: "sizefit::engine",
                    "Job {} failed: {}",
                    job.id(),
                    e
                );
                job.fail(e.user_message());
            }
        }
    }

    fn output_path_for(&self, job: &Job) -> Result<PathBuf, AppError> {
        let spec = job.spec();
        let path = spec.output_path.clone().unwrap_or_else(|| {
            self.config
                .output_dir
                .join(format!("{}.{}", job.id(), spec.container.extension()))
        });
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    async fn decoder_for(&self, spec: &JobSpec, encoder: &EncoderSpec) -> DecoderChoice {
        let source = spec.source_video_codec.as_deref();
        if spec.prefer_hw_decode
            && source != Some("av1")
            && let Some(hwaccel) = HwAccel::for_backend(encoder.backend, source)
        {
            self.capabilities.probe(ProbeTarget::Decoder(hwaccel)).await;
        }
        choose_decoder(source, encoder, spec.prefer_hw_decode, |h| {
            self.capabilities
                .get(&h.probe_key())
                .is_some_and(|e| e.passed)
        })
    }

    /// Planning and resolution. Errors here happen before any process starts.
    async fn prepare(&self, job: &Job) -> Result<(JobContext, BitratePlan), AppError> {
        let spec = job.spec();
        if !spec.duration_secs.is_finite() || spec.duration_secs <= 0.0 {
            return Err(AppError::InvalidDuration(spec.duration_secs));
        }
        let duration_secs = trimmed_duration(
            spec.duration_secs,
            spec.start_time.as_deref(),
            spec.end_time.as_deref(),
        );
        if spec.start_time.is_some() || spec.end_time.is_some() {
            job.log(format!(
                "Trimming: encoding {:.2}s of {:.2}s",
                duration_secs, spec.duration_secs
            ));
        }
        let first_plan = plan(
            spec.target_bytes(),
            duration_secs,
            spec.audio_policy(),
            &self.config,
        )?;
        self.report_budget(job, &first_plan);

        let request = CodecRequest::parse(&spec.codec);
        let targets: Vec<ProbeTarget> = request
            .chain()
            .into_iter()
            .map(ProbeTarget::Encoder)
            .collect();
        self.capabilities.ensure_probed(&targets).await;
        let encoder = self.resolver.resolve(&request)?;
        job.set_encoder(encoder.name);
        job.log(format!(
            "Using encoder: {} (requested: {})",
            encoder.name, spec.codec
        ));

        let decoder = self.decoder_for(spec, encoder).await;
        if decoder != DecoderChoice::Auto {
            job.log(format!("Decoder: using {}", decoder.describe()));
        }

        let (audio_codec, switched) = effective_audio_codec(spec.audio_codec, spec.container);
        if switched {
            job.log("mp4 container selected; switching audio codec from libopus to aac");
        }
        if audio_codec == AudioCodec::None {
            job.log("Audio removed (mute option enabled)");
        }

        Ok((
            JobContext {
                encoder,
                decoder,
                audio_codec,
                duration_secs,
            },
            first_plan,
        ))
    }

    /// Tell the job when the budget forced quality or audio down.
    fn report_budget(&self, job: &Job, plan: &BitratePlan) {
        if plan.low_quality {
            job.log(format!(
                "Warning: video bitrate {:.0}k is below {:.0}k, output quality will be low",
                plan.video_kbps, self.config.min_video_kbps
            ));
        }
        if !plan.audio_capped {
            return;
        }
        let requested = match job.spec().audio_policy() {
            AudioPolicy::Fixed(kbps) => format!("{}k", kbps),
            _ => "ladder".to_string(),
        };
        if plan.audio_kbps == 0 {
            job.log(format!(
                "Audio dropped: {:.0}k total budget cannot carry {} audio",
                plan.total_kbps, requested
            ));
        } else {
            job.log(format!(
                "Audio capped to {}k (requested {}) to fit the {:.0}k budget",
                plan.audio_kbps, requested, plan.total_kbps
            ));
        }
    }

    async fn drive(&self, job: &Job, started: Instant) -> Result<(), AppError> {
        let (ctx, first_plan) = self.prepare(job).await?;
        let output = self.output_path_for(job)?;
        let retry_path = retry_output_path(&output);

        let outcome = self.attempts(job, &ctx, &first_plan, &output, &retry_path).await;
        let (result, attempts) = match outcome {
            Ok(done) => done,
            Err(e) => {
                remove_quietly(&output);
                remove_quietly(&retry_path);
                return Err(e);
            }
        };

        let spec = job.spec();
        let stats = DoneStats {
            final_size_mb: round2(result.size_bytes as f64 / BYTES_PER_MB),
            target_size_mb: spec.target_size_mb,
            duration_s: round2(ctx.duration_secs),
            encoder: ctx.encoder.name.to_string(),
            attempts,
            output_path: path_to_string(&result.output_path),
            elapsed_s: round2(started.elapsed().as_secs_f64()),
        };
        log::info!(
            target: "sizefit::engine",
            "Job {} done: {:.2}MB (target {}MB) with {} in {} attempt(s)",
            job.id(),
            stats.final_size_mb,
            stats.target_size_mb,
            stats.encoder,
            attempts
        );
        job.complete(stats, result.output_path, result.size_bytes);
        Ok(())
    }

    /// First attempt plus at most one corrective pass. Returns the accepted
    /// result and the number of attempts made.
    async fn attempts(
        &self,
        job: &Job,
        ctx: &JobContext,
        first_plan: &BitratePlan,
        output: &Path,
        retry_path: &Path,
    ) -> Result<(AttemptResult, u32), AppError> {
        if job.is_cancel_requested() {
            return Err(AppError::canceled());
        }
        let first = self.execute(job, ctx, first_plan, output).await?;
        let target_bytes = job.spec().target_bytes();

        let decision = evaluate(
            first.size_bytes,
            target_bytes,
            job.retry_count(),
            self.config.effective_max_retries(),
            self.config.overage_threshold_percent,
        );
        let RetryDecision::Retry {
            overage_percent,
            adjusted_target_bytes,
        } = decision
        else {
            return Ok((first, 1));
        };

        if job.is_cancel_requested() {
            return Err(AppError::canceled());
        }
        log::info!(
            target: "sizefit::engine",
            "Job {} output {:.2}MB is {:.2}% over target, retrying once",
            job.id(),
            first.size_bytes as f64 / BYTES_PER_MB,
            overage_percent
        );
        job.begin_retry(round2(overage_percent));
        let retry_plan = plan(
            adjusted_target_bytes,
            ctx.duration_secs,
            job.spec().audio_policy(),
            &self.config,
        )?;
        job.log(format!(
            "Re-encoding at {:.0}k video (was {:.0}k)",
            retry_plan.video_kbps, first_plan.video_kbps
        ));
        self.report_budget(job, &retry_plan);

        match self.execute(job, ctx, &retry_plan, retry_path).await {
            Ok(second) => {
                std::fs::rename(&second.output_path, output)?;
                Ok((
                    AttemptResult {
                        output_path: output.to_path_buf(),
                        size_bytes: second.size_bytes,
                    },
                    2,
                ))
            }
            Err(AppError::Canceled) => Err(AppError::canceled()),
            Err(e) => {
                remove_quietly(retry_path);
                log::warn!(
                    target: "sizefit::engine",
                    "Job {} corrective pass failed, keeping first output: {}",
                    job.id(),
                    e
                );
                job.log(format!(
                    "Corrective re-encode failed, keeping first result: {}",
                    e.user_message().lines().next().unwrap_or_default()
                ));
                Ok((first, 2))
            }
        }
    }

    /// One attempt: build the command, run it, validate the output.
    async fn execute(
        &self,
        job: &Job,
        ctx: &JobContext,
        plan: &BitratePlan,
        output: &Path,
    ) -> Result<AttemptResult, AppError> {
        let spec = job.spec();
        let input = path_to_string(&spec.source_path);
        let output_str = path_to_string(output);
        let audio = (ctx.audio_codec != AudioCodec::None && plan.audio_kbps > 0)
            .then_some((ctx.audio_codec, plan.audio_kbps));
        let params = TranscodeParams {
            input: &input,
            output: &output_str,
            encoder: ctx.encoder,
            decoder: ctx.decoder,
            video_kbps: plan.video_kbps,
            audio,
            container: spec.container,
            preset: &spec.preset,
            tune: &spec.tune,
            max_width: spec.max_width,
            max_height: spec.max_height,
            start_time: spec.start_time.as_deref(),
            end_time: spec.end_time.as_deref(),
            vaapi_device: &self.config.vaapi_device,
        };
        let args = build_transcode_args(&params);
        job.log(format!("FFmpeg command: ffmpeg {}", format_args_for_display(&args)));

        let settings = RunSettings {
            total_secs: ctx.duration_secs,
            finalizing_threshold: self.config.finalizing_threshold_percent,
            emit_interval: self.config.progress_emit_interval(),
            cancel_grace: self.config.cancel_grace(),
        };
        run_ffmpeg(
            &self.ffmpeg,
            &args,
            &settings,
            job.cancel_token(),
            |event| match event {
                RunEvent::Progress { percent, phase } => job.set_progress(percent, phase),
                RunEvent::Log(line) => job.log(line),
            },
        )
        .await?;

        let size_bytes = std::fs::metadata(output).map(|m| m.len()).unwrap_or(0);
        if size_bytes == 0 {
            return Err(AppError::encode_failed(
                0,
                format!("FFmpeg exited cleanly but {} is missing or empty", output_str),
            ));
        }
        Ok(AttemptResult {
            output_path: output.to_path_buf(),
            size_bytes,
        })
    }
}
