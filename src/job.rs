//! Job records, lifecycle transitions and the per-job event channel.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::{AudioCodec, Container};
use crate::ffmpeg::Phase;
use crate::planner::{AudioPolicy, BYTES_PER_MB};

fn default_codec() -> String {
    "h264".to_string()
}

fn default_preset() -> String {
    "p6".to_string()
}

fn default_tune() -> String {
    "hq".to_string()
}

/// What the transport hands to `Scheduler::submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub source_path: PathBuf,
    /// Defaults to `<output_dir>/<job id>.<container>`.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(rename = "targetSizeMB", alias = "targetSizeMb")]
    pub target_size_mb: f64,
    /// From input analysis.
    pub duration_secs: f64,
    /// From input analysis; drives the decoder choice.
    #[serde(default)]
    pub source_video_codec: Option<String>,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default)]
    pub container: Container,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_tune")]
    pub tune: String,
    #[serde(default)]
    pub audio_codec: AudioCodec,
    /// Fixed audio rate. None lets the planner pick.
    #[serde(default)]
    pub audio_bitrate_kbps: Option<u32>,
    #[serde(default)]
    pub max_width: Option<u32>,
    #[serde(default)]
    pub max_height: Option<u32>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub prefer_hw_decode: bool,
}

impl JobSpec {
    pub fn new(source_path: impl Into<PathBuf>, target_size_mb: f64, duration_secs: f64) -> Self {
        Self {
            source_path: source_path.into(),
            output_path: None,
            target_size_mb,
            duration_secs,
            source_video_codec: None,
            codec: default_codec(),
            container: Container::default(),
            preset: default_preset(),
            tune: default_tune(),
            audio_codec: AudioCodec::default(),
            audio_bitrate_kbps: None,
            max_width: None,
            max_height: None,
            start_time: None,
            end_time: None,
            prefer_hw_decode: false,
        }
    }

    pub fn target_bytes(&self) -> f64 {
        self.target_size_mb * BYTES_PER_MB
    }

    pub fn audio_policy(&self) -> AudioPolicy {
        match (self.audio_codec, self.audio_bitrate_kbps) {
            (AudioCodec::None, _) => AudioPolicy::Muted,
            (_, Some(kbps)) => AudioPolicy::Fixed(kbps),
            (_, None) => AudioPolicy::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Canceled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoneStats {
    pub final_size_mb: f64,
    pub target_size_mb: f64,
    pub duration_s: f64,
    pub encoder: String,
    pub attempts: u32,
    pub output_path: String,
    pub elapsed_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Progress { progress: f64, phase: Phase },
    Log { message: String },
    Retry { overage_percent: f64 },
    Done { stats: DoneStats },
    Error { message: String },
    Canceled,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Done { .. } | JobEvent::Error { .. } | JobEvent::Canceled
        )
    }
}

#[derive(Debug, Clone)]
struct JobRecord {
    state: JobState,
    phase: Option<Phase>,
    progress: f64,
    created_at: OffsetDateTime,
    started_at: Option<OffsetDateTime>,
    completed_at: Option<OffsetDateTime>,
    error: Option<String>,
    output_path: Option<PathBuf>,
    encoder: Option<String>,
    retry_count: u32,
    final_size_bytes: Option<u64>,
}

/// Point-in-time view for status queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: Uuid,
    pub state: JobState,
    pub phase: Option<Phase>,
    pub progress: f64,
    #[serde(rename = "targetSizeMB")]
    pub target_size_mb: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
    pub encoder: Option<String>,
    pub retry_count: u32,
    pub final_size_bytes: Option<u64>,
}

/// A submitted job. Observers hold it through a `JobHandle`; only the
/// engine drives transitions.
pub struct Job {
    id: Uuid,
    spec: JobSpec,
    record: Mutex<JobRecord>,
    /// Taken at the terminal transition so the channel closes.
    events: Mutex<Option<broadcast::Sender<JobEvent>>>,
    state_tx: watch::Sender<JobState>,
    cancel: CancellationToken,
}

pub type JobHandle = Arc<Job>;

impl Job {
    /// A fresh job plus a receiver that sees every event it will publish.
    pub(crate) fn with_receiver(
        spec: JobSpec,
        event_capacity: usize,
    ) -> (Arc<Self>, broadcast::Receiver<JobEvent>) {
        let (events, rx) = broadcast::channel(event_capacity.max(1));
        let (state_tx, _) = watch::channel(JobState::Queued);
        let job = Arc::new(Self {
            id: Uuid::new_v4(),
            spec,
            record: Mutex::new(JobRecord {
                state: JobState::Queued,
                phase: None,
                progress: 0.0,
                created_at: OffsetDateTime::now_utc(),
                started_at: None,
                completed_at: None,
                error: None,
                output_path: None,
                encoder: None,
                retry_count: 0,
                final_size_bytes: None,
            }),
            events: Mutex::new(Some(events)),
            state_tx,
            cancel: CancellationToken::new(),
        });
        (job, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn state(&self) -> JobState {
        self.record.lock().state
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let r = self.record.lock();
        JobSnapshot {
            id: self.id,
            state: r.state,
            phase: r.phase,
            progress: r.progress,
            target_size_mb: self.spec.target_size_mb,
            created_at: r.created_at,
            started_at: r.started_at,
            completed_at: r.completed_at,
            error: r.error.clone(),
            output_path: r.output_path.clone(),
            encoder: r.encoder.clone(),
            retry_count: r.retry_count,
            final_size_bytes: r.final_size_bytes,
        }
    }

    /// Attach an observer. Returns None once the job has finished and the
    /// channel is closed. Late subscribers miss earlier events.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<JobEvent>> {
        self.events.lock().as_ref().map(|tx| tx.subscribe())
    }

    /// Ask the job to stop. A no-op once the job is terminal. A job still
    /// waiting for a slot ends `canceled` right away.
    pub fn cancel(&self) {
        if self.state().is_terminal() {
            log::debug!(
                target: "sizefit::job",
                "Cancel ignored for finished job {}",
                self.id
            );
            return;
        }
        log::info!(target: "sizefit::job", "Cancel requested for job {}", self.id);
        self.cancel.cancel();
        self.finish_from(
            |s| s == JobState::Queued,
            JobState::Canceled,
            JobEvent::Canceled,
            |_| {},
        );
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolves with the terminal state.
    pub async fn wait(&self) -> JobState {
        let mut rx = self.state_tx.subscribe();
        if let Ok(state) = rx.wait_for(|s| s.is_terminal()).await {
            return *state;
        }
        self.state()
    }

    fn publish(&self, event: JobEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            // No receivers is fine.
            let _ = tx.send(event);
        }
    }

    /// Queued -> Running. False if the job already left the queue.
    pub(crate) fn mark_running(&self) -> bool {
        {
            let mut r = self.record.lock();
            if r.state != JobState::Queued {
                return false;
            }
            r.state = JobState::Running;
            r.phase = Some(Phase::Encoding);
            r.progress = 0.0;
            r.started_at = Some(OffsetDateTime::now_utc());
        }
        self.state_tx.send_replace(JobState::Running);
        true
    }

    pub(crate) fn set_progress(&self, percent: f64, phase: Phase) {
        {
            let mut r = self.record.lock();
            if r.state != JobState::Running {
                return;
            }
            r.progress = percent;
            r.phase = Some(phase);
        }
        self.publish(JobEvent::Progress {
            progress: percent,
            phase,
        });
    }

    pub(crate) fn log(&self, message: impl Into<String>) {
        self.publish(JobEvent::Log {
            message: message.into(),
        });
    }

    pub(crate) fn set_encoder(&self, encoder: &str) {
        self.record.lock().encoder = Some(encoder.to_string());
    }

    pub fn retry_count(&self) -> u32 {
        self.record.lock().retry_count
    }

    /// Start the corrective attempt: progress resets and a `retry` event
    /// marks the boundary.
    pub(crate) fn begin_retry(&self, overage_percent: f64) {
        {
            let mut r = self.record.lock();
            r.retry_count += 1;
            r.progress = 0.0;
            r.phase = Some(Phase::Encoding);
        }
        self.publish(JobEvent::Retry { overage_percent });
    }

    pub(crate) fn complete(&self, stats: DoneStats, output_path: PathBuf, size_bytes: u64) -> bool {
        self.finish(JobState::Completed, JobEvent::Done { stats }, |r| {
            r.phase = Some(Phase::Done);
            r.progress = 100.0;
            r.output_path = Some(output_path);
            r.final_size_bytes = Some(size_bytes);
        })
    }

    pub(crate) fn fail(&self, message: String) -> bool {
        let event = JobEvent::Error {
            message: message.clone(),
        };
        self.finish(JobState::Failed, event, |r| r.error = Some(message))
    }

    pub(crate) fn mark_canceled(&self) -> bool {
        self.finish(JobState::Canceled, JobEvent::Canceled, |_| {})
    }

    /// Single terminal transition: later calls are ignored. Publishes the
    /// terminal event and then closes the channel.
    fn finish(&self, state: JobState, event: JobEvent, update: impl FnOnce(&mut JobRecord)) -> bool {
        self.finish_from(|s| !s.is_terminal(), state, event, update)
    }

    fn finish_from(
        &self,
        allowed: impl Fn(JobState) -> bool,
        state: JobState,
        event: JobEvent,
        update: impl FnOnce(&mut JobRecord),
    ) -> bool {
        let mut r = self.record.lock();
        if !allowed(r.state) {
            log::debug!(
                target: "sizefit::job",
                "Job {} already {:?}, ignoring {:?}",
                self.id,
                r.state,
                state
            );
            return false;
        }
        r.state = state;
        r.completed_at = Some(OffsetDateTime::now_utc());
        update(&mut *r);
        if let Some(tx) = self.events.lock().take() {
            let _ = tx.send(event);
        }
        drop(r);
        self.state_tx.send_replace(state);
        log::info!(target: "sizefit::job", "Job {} -> {:?}", self.id, state);
        true
    }
}
