use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use sizefit_core::error::AppError;
use sizefit_core::ffmpeg::parse_ffmpeg_error;
use sizefit_core::{Engine, EngineConfig, JobEvent, JobHandle, JobSpec, ProbeTarget, Scheduler};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: u64,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, serde::Serialize)]
struct RpcSuccess {
    id: u64,
    result: Value,
}

#[derive(Debug, serde::Serialize)]
struct RpcFailure {
    id: u64,
    error: RpcErrorPayload,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct RpcErrorPayload {
    summary: String,
    detail: String,
}

#[derive(Debug, serde::Serialize)]
struct RpcEvent {
    event: String,
    payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobIdParams {
    job_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct ReprobeParams {
    key: String,
}

type SharedWriter = Arc<Mutex<io::Stdout>>;

fn write_json_line<T: serde::Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value)
        .map_err(|e| io::Error::other(format!("serialize response: {}", e)))?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn write_json_line_shared<T: serde::Serialize>(writer: &SharedWriter, value: &T) -> io::Result<()> {
    let mut guard = writer.lock();
    write_json_line(&mut *guard, value)
}

fn emit_rpc_event(writer: &SharedWriter, event: &str, payload: Value) {
    let message = RpcEvent {
        event: event.to_string(),
        payload,
    };
    let _ = write_json_line_shared(writer, &message);
}

fn parse_error_payload(err: &AppError) -> RpcErrorPayload {
    match err {
        AppError::EncodeFailed { code, stderr } if *code == -1 => RpcErrorPayload {
            summary: stderr.clone(),
            detail: stderr.clone(),
        },
        AppError::EncodeFailed { code, stderr } => {
            let parsed = parse_ffmpeg_error(stderr, Some(*code));
            RpcErrorPayload {
                summary: parsed.summary,
                detail: parsed.detail,
            }
        }
        _ => {
            let text = err.to_string();
            RpcErrorPayload {
                summary: text.clone(),
                detail: text,
            }
        }
    }
}

fn params_from_value<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, AppError> {
    serde_json::from_value(params)
        .map_err(|e| AppError::from(format!("Invalid params payload: {}", e)))
}

fn to_value<T: serde::Serialize>(value: T, what: &str) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|e| AppError::from(format!("Failed to serialize {}: {}", what, e)))
}

fn unknown_job(id: Uuid) -> AppError {
    AppError::from(format!("Unknown jobId: {}", id))
}

/// Forward one job's events until its channel closes.
fn forward_job_events(
    job_id: Uuid,
    mut rx: broadcast::Receiver<JobEvent>,
    writer: &SharedWriter,
) {
    let writer = Arc::clone(writer);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let mut payload = serde_json::to_value(&event).unwrap_or(Value::Null);
                    if let Value::Object(map) = &mut payload {
                        map.insert("jobId".into(), json!(job_id));
                    }
                    emit_rpc_event(&writer, "job.event", payload);
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!(
                        target: "sizefit::worker",
                        "Job {} observer lagged, {} event(s) dropped",
                        job_id,
                        skipped
                    );
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn dispatch(
    method: &str,
    params: Value,
    scheduler: &Arc<Scheduler>,
    writer: &SharedWriter,
) -> Result<Value, AppError> {
    match method {
        "job.submit" => {
            let spec: JobSpec = params_from_value(params)?;
            let (job, events) = scheduler.submit_subscribed(spec);
            forward_job_events(job.id(), events, writer);
            Ok(json!({ "jobId": job.id(), "state": job.state() }))
        }
        "job.cancel" => {
            let parsed: JobIdParams = params_from_value(params)?;
            let job = scheduler.get(parsed.job_id).ok_or_else(|| unknown_job(parsed.job_id))?;
            let was_terminal = job.state().is_terminal();
            job.cancel();
            Ok(json!({ "cancelled": !was_terminal, "jobId": parsed.job_id }))
        }
        "job.status" => {
            if params.is_null() {
                return to_value(scheduler.jobs(), "job list");
            }
            let parsed: JobIdParams = params_from_value(params)?;
            let job = scheduler.get(parsed.job_id).ok_or_else(|| unknown_job(parsed.job_id))?;
            to_value(job.snapshot(), "job status")
        }
        "capabilities.list" => to_value(
            scheduler.engine().capabilities().entries(),
            "capabilities",
        ),
        "capabilities.reprobe" => {
            let parsed: ReprobeParams = params_from_value(params)?;
            let target = ProbeTarget::from_key(&parsed.key)
                .ok_or_else(|| AppError::from(format!("Unknown probe key: {}", parsed.key)))?;
            let entry = scheduler.engine().capabilities().reprobe(target).await;
            to_value(entry, "capability")
        }
        _ => Err(AppError::from(format!("Unknown method: {}", method))),
    }
}

async fn handle_request(request: RpcRequest, scheduler: &Arc<Scheduler>, writer: &SharedWriter) {
    let response = match dispatch(&request.method, request.params, scheduler, writer).await {
        Ok(result) => serde_json::to_value(RpcSuccess {
            id: request.id,
            result,
        })
        .map_err(|e| io::Error::other(format!("serialize success: {}", e))),
        Err(err) => {
            let payload = parse_error_payload(&err);
            serde_json::to_value(RpcFailure {
                id: request.id,
                error: payload,
            })
            .map_err(|e| io::Error::other(format!("serialize failure: {}", e)))
        }
    };

    match response {
        Ok(value) => {
            let _ = write_json_line_shared(writer, &value);
        }
        Err(err) => {
            let failure = RpcFailure {
                id: request.id,
                error: RpcErrorPayload {
                    summary: "Serialization error".to_string(),
                    detail: err.to_string(),
                },
            };
            let _ = write_json_line_shared(writer, &failure);
        }
    }
}

fn load_config() -> Result<EngineConfig, AppError> {
    match std::env::var_os("SIZEFIT_CONFIG") {
        Some(path) => EngineConfig::from_json_file(&PathBuf::from(path)),
        None => EngineConfig::from_env(),
    }
}

#[tokio::main]
async fn main() -> io::Result<()> {
    sizefit_core::logging::init();
    let stdout: SharedWriter = Arc::new(Mutex::new(io::stdout()));

    let engine = match load_config().and_then(Engine::new) {
        Ok(engine) => engine,
        Err(err) => {
            log::error!(target: "sizefit::worker", "Startup failed: {}", err);
            emit_rpc_event(
                &stdout,
                "worker.fatal",
                json!({ "summary": "Startup failed", "detail": err.to_string() }),
            );
            return Err(io::Error::other(err.to_string()));
        }
    };
    engine.capabilities().warm_up().await;
    let scheduler = Scheduler::new(engine);
    emit_rpc_event(&stdout, "worker.ready", json!({}));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                let failure = RpcFailure {
                    id: 0,
                    error: RpcErrorPayload {
                        summary: "Invalid input stream".to_string(),
                        detail: err.to_string(),
                    },
                };
                let _ = write_json_line_shared(&stdout, &failure);
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let failure = RpcFailure {
                    id: 0,
                    error: RpcErrorPayload {
                        summary: "Invalid request".to_string(),
                        detail: err.to_string(),
                    },
                };
                let _ = write_json_line_shared(&stdout, &failure);
                continue;
            }
        };

        let scheduler = Arc::clone(&scheduler);
        let writer = Arc::clone(&stdout);
        tokio::spawn(async move {
            handle_request(request, &scheduler, &writer).await;
        });
    }

    // Stdin closed: stop whatever is still in flight before exiting.
    let pending: Vec<JobHandle> = scheduler
        .jobs()
        .iter()
        .filter(|s| !s.state.is_terminal())
        .filter_map(|s| scheduler.get(s.id))
        .collect();
    for job in &pending {
        job.cancel();
    }
    for job in &pending {
        job.wait().await;
    }
    Ok(())
}
