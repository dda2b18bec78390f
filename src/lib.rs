pub mod capability;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod ffmpeg;
pub mod job;
pub mod logging;
pub mod planner;
pub mod retry;
pub mod scheduler;

pub use capability::{CapabilityEntry, CapabilityTable, ProbeTarget};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::AppError;
pub use job::{DoneStats, JobEvent, JobHandle, JobSnapshot, JobSpec, JobState};
pub use scheduler::Scheduler;
