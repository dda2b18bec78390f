//! Bounded FIFO admission. Jobs queue in submission order and start when one
//! of `max_concurrency` slots frees up.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, broadcast, mpsc};
use uuid::Uuid;

use crate::engine::Engine;
use crate::job::{Job, JobEvent, JobHandle, JobSnapshot, JobSpec, JobState};

pub struct Scheduler {
    engine: Arc<Engine>,
    jobs: Mutex<HashMap<Uuid, JobHandle>>,
    /// Submission order, kept for listing.
    order: Mutex<Vec<Uuid>>,
    queue_tx: mpsc::UnboundedSender<JobHandle>,
    running: Arc<AtomicUsize>,
}

/// Decrements the running count when a job task ends, however it ends.
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Scheduler {
    /// Start the dispatcher. Must be called inside a tokio runtime.
    pub fn new(engine: Engine) -> Arc<Self> {
        let engine = Arc::new(engine);
        let slots = engine.config().max_concurrency;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicUsize::new(0));
        tokio::spawn(dispatch(
            Arc::clone(&engine),
            queue_rx,
            Arc::new(Semaphore::new(slots)),
            Arc::clone(&running),
        ));
        log::info!(
            target: "sizefit::scheduler",
            "Scheduler started with {} slot(s)",
            slots
        );
        Arc::new(Self {
            engine,
            jobs: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            queue_tx,
            running,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Register a job and queue it. Returns at once; the handle reports progress.
    pub fn submit(&self, spec: JobSpec) -> JobHandle {
        self.submit_subscribed(spec).0
    }

    /// Like [`Scheduler::submit`], plus a receiver attached before the job
    /// is queued, so it sees every event from `running` to the terminal one.
    pub fn submit_subscribed(&self, spec: JobSpec) -> (JobHandle, broadcast::Receiver<JobEvent>) {
        let (job, events) = Job::with_receiver(spec, self.engine.config().event_capacity);
        self.jobs.lock().insert(job.id(), Arc::clone(&job));
        self.order.lock().push(job.id());
        log::info!(
            target: "sizefit::scheduler",
            "Job {} queued ({} waiting)",
            job.id(),
            self.queue_len()
        );
        if self.queue_tx.send(Arc::clone(&job)).is_err() {
            job.fail("Scheduler is not running".to_string());
        }
        (job, events)
    }

    pub fn get(&self, id: Uuid) -> Option<JobHandle> {
        self.jobs.lock().get(&id).cloned()
    }

    /// Cancel by id. False when the id is unknown.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.get(id) {
            Some(job) => {
                job.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshots in submission order.
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock();
        self.order
            .lock()
            .iter()
            .filter_map(|id| jobs.get(id).map(|j| j.snapshot()))
            .collect()
    }

    /// Forget a finished job. Running and queued jobs are kept.
    pub fn evict(&self, id: Uuid) -> bool {
        let mut jobs = self.jobs.lock();
        match jobs.get(&id) {
            Some(job) if job.state().is_terminal() => {
                jobs.remove(&id);
                self.order.lock().retain(|j| *j != id);
                true
            }
            _ => false,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.count_in(JobState::Queued)
    }

    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn count_in(&self, state: JobState) -> usize {
        self.jobs
            .lock()
            .values()
            .filter(|j| j.state() == state)
            .count()
    }
}

/// Takes jobs in order, waits for a slot, then hands the job and its permit
/// to a task. A job canceled while waiting never starts.
async fn dispatch(
    engine: Arc<Engine>,
    mut queue_rx: mpsc::UnboundedReceiver<JobHandle>,
    slots: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
) {
    while let Some(job) = queue_rx.recv().await {
        let permit = tokio::select! {
            biased;
            _ = job.cancel_token().cancelled() => None,
            permit = Arc::clone(&slots).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            job.mark_canceled();
            continue;
        };
        if !job.mark_running() {
            log::debug!(
                target: "sizefit::scheduler",
                "Job {} left the queue before admission ({:?})",
                job.id(),
                job.state()
            );
            continue;
        }

        running.fetch_add(1, Ordering::SeqCst);
        let guard = RunningGuard(Arc::clone(&running));
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            engine.run(&job).await;
        });
    }
    log::debug!(target: "sizefit::scheduler", "Dispatcher stopped");
}
