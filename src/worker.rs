use crate::{AutoscalerError, HandlerTable, Job, JobBroker, JobHandler};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Back-off after a broker error inside the worker loop.
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

const ABORTED_REASON: &str = "aborted: shutdown timeout";

/// Job currently held by a worker, visible to its handle.
type InFlight = Arc<Mutex<Option<Job>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WorkerState {
    Starting = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Starting,
            1 => WorkerState::Running,
            2 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }
}

#[derive(Debug, Clone)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(WorkerState::Starting as u8)))
    }

    fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move to `Running` unless a drain already started.
    fn mark_running(&self) {
        let _ = self.0.compare_exchange(
            WorkerState::Starting as u8,
            WorkerState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// A running worker bound to exactly one queue and one job handler.
///
/// `close` consumes the handle, so a stopped worker can never be reused.
pub struct WorkerHandle {
    id: String,
    queue: String,
    state: SharedState,
    shutdown: CancellationToken,
    broker: Arc<dyn JobBroker>,
    in_flight: InFlight,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("state", &self.state.get())
            .finish()
    }
}

impl WorkerHandle {
    /// Register the worker with the broker and spawn its job loop.
    pub async fn start(
        id: String,
        queue: String,
        broker: Arc<dyn JobBroker>,
        handler: Arc<dyn JobHandler>,
        poll_timeout: Duration,
    ) -> Result<Self, AutoscalerError> {
        let state = SharedState::new();
        let shutdown = CancellationToken::new();
        let in_flight: InFlight = Arc::new(Mutex::new(None));

        broker
            .register_worker(&queue, &id)
            .await
            .map_err(|e| AutoscalerError::WorkerLifecycle {
                queue: queue.clone(),
                reason: format!("failed to register worker {}: {}", id, e),
            })?;

        let task = tokio::spawn(run_worker(
            id.clone(),
            queue.clone(),
            broker.clone(),
            handler,
            poll_timeout,
            state.clone(),
            shutdown.clone(),
            in_flight.clone(),
        ));

        #[cfg(feature = "tracing")]
        tracing::debug!(worker_id = %id, queue = %queue, "Started worker");

        Ok(Self {
            id,
            queue,
            state,
            shutdown,
            broker,
            in_flight,
            task: Some(task),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// Ask the worker to stop taking jobs, let its in-flight poll and job
    /// finish, and wait at most `timeout` before aborting it.
    ///
    /// An aborted worker's job is reported failed and the worker is
    /// unregistered, so the broker never keeps a job active with nobody
    /// running it.
    pub async fn close(mut self, timeout: Duration) -> Result<(), AutoscalerError> {
        self.state.set(WorkerState::Draining);
        self.shutdown.cancel();

        let result = match self.task.take() {
            Some(mut task) => match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) if e.is_panic() => Err(AutoscalerError::WorkerLifecycle {
                    queue: self.queue.clone(),
                    reason: format!("worker {} panicked: {}", self.id, e),
                }),
                Ok(Err(_)) => Ok(()),
                Err(_) => {
                    task.abort();
                    let _ = (&mut task).await;
                    self.release_after_abort().await;
                    Err(AutoscalerError::ShutdownTimeout {
                        worker_id: self.id.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            },
            None => Ok(()),
        };

        self.state.set(WorkerState::Stopped);
        result
    }

    async fn release_after_abort(&self) {
        let job = match self.in_flight.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(job) = job {
            #[cfg(feature = "tracing")]
            tracing::warn!(worker_id = %self.id, job_id = %job.id, "Failing job of aborted worker");

            if let Err(e) = self.broker.fail(&job, ABORTED_REASON).await {
                #[cfg(feature = "tracing")]
                tracing::error!(job_id = %job.id, error = %e, "Failed to mark aborted job failed");
                #[cfg(not(feature = "tracing"))]
                let _ = e;
            }
        }

        if let Err(e) = self.broker.unregister_worker(&self.queue, &self.id).await {
            #[cfg(feature = "tracing")]
            tracing::error!(worker_id = %self.id, error = %e, "Failed to unregister aborted worker");
            #[cfg(not(feature = "tracing"))]
            let _ = e;
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // A handle dropped without close() must not leave an orphan task.
        if let Some(task) = self.task.take() {
            self.shutdown.cancel();
            task.abort();
        }
    }
}

async fn run_worker(
    id: String,
    queue: String,
    broker: Arc<dyn JobBroker>,
    handler: Arc<dyn JobHandler>,
    poll_timeout: Duration,
    state: SharedState,
    shutdown: CancellationToken,
    in_flight: InFlight,
) {
    state.mark_running();

    // Drain is checked between polls; a blocking fetch is never interrupted.
    while !shutdown.is_cancelled() {
        match broker.fetch_next(&queue, poll_timeout).await {
            Ok(Some(job)) => {
                set_in_flight(&in_flight, Some(job.clone()));
                process_job(&id, broker.as_ref(), handler.as_ref(), job).await;
                set_in_flight(&in_flight, None);
            }
            Ok(None) => {
                if let Err(e) = broker.heartbeat(&id).await {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(worker_id = %id, error = %e, "Failed to update heartbeat");
                    #[cfg(not(feature = "tracing"))]
                    let _ = e;
                }
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(worker_id = %id, queue = %queue, error = %e, "Error fetching job");
                #[cfg(not(feature = "tracing"))]
                let _ = e;

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(FETCH_ERROR_BACKOFF) => {}
                }
            }
        }
    }

    if let Err(e) = broker.unregister_worker(&queue, &id).await {
        #[cfg(feature = "tracing")]
        tracing::error!(worker_id = %id, error = %e, "Failed to unregister worker");
        #[cfg(not(feature = "tracing"))]
        let _ = e;
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(worker_id = %id, queue = %queue, "Worker stopped");
}

fn set_in_flight(slot: &InFlight, job: Option<Job>) {
    match slot.lock() {
        Ok(mut current) => *current = job,
        Err(poisoned) => *poisoned.into_inner() = job,
    }
}

async fn process_job(worker_id: &str, broker: &dyn JobBroker, handler: &dyn JobHandler, job: Job) {
    #[cfg(feature = "tracing")]
    let started = std::time::Instant::now();
    #[cfg(not(feature = "tracing"))]
    let _ = worker_id;

    match handler.handle(&job).await {
        Ok(()) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                worker_id = worker_id,
                job_id = %job.id,
                job_name = %job.name,
                duration_ms = started.elapsed().as_millis() as u64,
                "Job completed"
            );

            if let Err(e) = broker.complete(&job).await {
                #[cfg(feature = "tracing")]
                tracing::error!(job_id = %job.id, error = %e, "Failed to mark job completed");
                #[cfg(not(feature = "tracing"))]
                let _ = e;
            }
        }
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::error!(
                worker_id = worker_id,
                job_id = %job.id,
                job_name = %job.name,
                error = %e,
                "Job failed"
            );

            if let Err(e) = broker.fail(&job, &e.to_string()).await {
                #[cfg(feature = "tracing")]
                tracing::error!(job_id = %job.id, error = %e, "Failed to mark job failed");
                #[cfg(not(feature = "tracing"))]
                let _ = e;
            }
        }
    }
}

/// Creates and retires workers on behalf of the pool.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, queue: &str, worker_id: String) -> Result<WorkerHandle, AutoscalerError>;

    async fn retire(&self, handle: WorkerHandle, timeout: Duration) -> Result<(), AutoscalerError> {
        handle.close(timeout).await
    }
}

/// Spawns workers that pull from the shared broker and run the queue's
/// registered handler.
pub struct BrokerWorkerSpawner {
    broker: Arc<dyn JobBroker>,
    handlers: HandlerTable,
    poll_timeout: Duration,
}

impl BrokerWorkerSpawner {
    pub fn new(broker: Arc<dyn JobBroker>, handlers: HandlerTable, poll_timeout: Duration) -> Self {
        Self {
            broker,
            handlers,
            poll_timeout,
        }
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }
}

#[async_trait]
impl WorkerSpawner for BrokerWorkerSpawner {
    async fn spawn(&self, queue: &str, worker_id: String) -> Result<WorkerHandle, AutoscalerError> {
        let handler = self
            .handlers
            .get(queue)
            .ok_or_else(|| AutoscalerError::WorkerLifecycle {
                queue: queue.to_string(),
                reason: "no job handler registered".to_string(),
            })?;

        WorkerHandle::start(
            worker_id,
            queue.to_string(),
            self.broker.clone(),
            handler,
            self.poll_timeout,
        )
        .await
    }
}
