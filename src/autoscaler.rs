use crate::decision::recommend;
use crate::events::ScaleTrigger;
use crate::pool::{PoolChange, WorkerPool};
use crate::{
    AutoscalerError, JobBroker, QueueConfig, QueueMetricsCollector, QueueMetricsSnapshot,
    QueueRegistry, ScalingDecision,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default pause between two passes.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoscalerState {
    Uninitialized,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for AutoscalerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What happened to one queue during a pass.
#[derive(Debug)]
pub enum QueueOutcome {
    Scaled {
        snapshot: QueueMetricsSnapshot,
        decision: ScalingDecision,
        change: PoolChange,
    },
    /// Metrics could not be read; the pool was left untouched.
    Skipped { queue: String, reason: String },
}

impl QueueOutcome {
    pub fn queue(&self) -> &str {
        match self {
            QueueOutcome::Scaled { decision, .. } => &decision.queue,
            QueueOutcome::Skipped { queue, .. } => queue,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, QueueOutcome::Skipped { .. })
    }
}

/// Per-queue outcomes of one pass, in registry order.
#[derive(Debug, Default)]
pub struct PassReport {
    pub outcomes: Vec<QueueOutcome>,
}

impl PassReport {
    pub fn outcome(&self, queue: &str) -> Option<&QueueOutcome> {
        self.outcomes.iter().find(|o| o.queue() == queue)
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_skipped()).count()
    }

    /// Workers created plus workers closed across all queues.
    pub fn mutations(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match o {
                QueueOutcome::Scaled { change, .. } => change.created + change.closed,
                QueueOutcome::Skipped { .. } => 0,
            })
            .sum()
    }
}

/// Cloneable stop trigger, e.g. for a signal handler.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    /// Request a stop. The loop observes it after the current pass or at
    /// the end of the current sleep.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Control loop over every configured queue.
///
/// Runs as a single task: queues are processed one after another and a pass
/// never overlaps the next. Only one autoscaler should drive a given set of
/// queues at a time.
pub struct Autoscaler {
    registry: QueueRegistry,
    collector: QueueMetricsCollector,
    pool: WorkerPool,
    broker: Arc<dyn JobBroker>,
    tick_interval: Duration,
    state: watch::Sender<AutoscalerState>,
    stop: StopHandle,
}

impl Autoscaler {
    pub fn new(
        registry: QueueRegistry,
        broker: Arc<dyn JobBroker>,
        pool: WorkerPool,
        tick_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(AutoscalerState::Uninitialized);
        Self {
            registry,
            collector: QueueMetricsCollector::new(broker.clone()),
            pool,
            broker,
            tick_interval,
            state,
            stop: StopHandle::default(),
        }
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn worker_count(&self, queue: &str) -> usize {
        self.pool.worker_count(queue)
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn state(&self) -> AutoscalerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AutoscalerState> {
        self.state.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn set_state(&self, state: AutoscalerState) {
        self.state.send_replace(state);

        #[cfg(feature = "tracing")]
        tracing::debug!(state = %state, "Autoscaler state changed");
    }

    /// Validate the queue set and bring every queue up to its minimum.
    ///
    /// Worker creation failures are logged and left to the next pass; only an
    /// invalid queue set is fatal.
    pub async fn initialize(&mut self) -> Result<(), AutoscalerError> {
        self.set_state(AutoscalerState::Initializing);

        if let Err(e) = self.registry.validate() {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %e, "Invalid queue configuration");

            self.set_state(AutoscalerState::Stopped);
            return Err(e);
        }

        let queues: Vec<(String, usize)> = self
            .registry
            .iter()
            .map(|q| (q.name.clone(), q.min_workers))
            .collect();

        for (queue, min_workers) in queues {
            let change = self
                .pool
                .set_worker_count(&queue, min_workers, ScaleTrigger::Initialization)
                .await;

            #[cfg(feature = "tracing")]
            {
                for failure in &change.failures {
                    tracing::warn!(queue = %queue, error = %failure, "Failed to start worker during initialization");
                }
                tracing::info!(queue = %queue, workers = change.after, "Initialized queue");
            }
            #[cfg(not(feature = "tracing"))]
            let _ = change;
        }

        self.set_state(AutoscalerState::Running);

        #[cfg(feature = "tracing")]
        tracing::info!(
            queues = self.registry.len(),
            workers = self.pool.total_workers(),
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            "Started autoscaler"
        );

        Ok(())
    }

    /// One full pass: collect, decide and apply for each queue in turn.
    /// A failing queue is skipped and never aborts the pass.
    pub async fn tick(&mut self) -> PassReport {
        #[cfg(feature = "tracing")]
        let tracker = crate::tracing_utils::PerformanceTracker::new("autoscaler_pass")
            .with_context("queues", self.registry.len());

        let queues: Vec<QueueConfig> = self.registry.iter().cloned().collect();
        let mut report = PassReport {
            outcomes: Vec::with_capacity(queues.len()),
        };

        for config in &queues {
            report.outcomes.push(self.tick_queue(config).await);
        }

        #[cfg(feature = "tracing")]
        {
            let mut tracker = tracker;
            tracker.add_context("skipped", report.skipped());
            tracker.add_context("mutations", report.mutations());
            tracker.trace_completion();
        }

        report
    }

    async fn tick_queue(&mut self, config: &QueueConfig) -> QueueOutcome {
        let current = self.pool.worker_count(&config.name);

        let snapshot = match self.collector.collect(&config.name, current).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(queue = %config.name, error = %e, "Skipping queue this pass");

                return QueueOutcome::Skipped {
                    queue: config.name.clone(),
                    reason: e.to_string(),
                };
            }
        };

        let decision = recommend(config, &snapshot, current);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            queue = %config.name,
            waiting_jobs = snapshot.waiting_jobs,
            active_jobs = snapshot.active_jobs,
            lag_ms = snapshot.lag_ms,
            avg_job_duration_ms = snapshot.avg_job_duration_ms,
            current = decision.current,
            recommended = decision.recommended,
            rule = %decision.rule,
            "Scaling decision"
        );

        let change = self.pool.apply(&decision, &snapshot).await;

        #[cfg(feature = "tracing")]
        for failure in &change.failures {
            tracing::warn!(queue = %config.name, error = %failure, "Worker pool change incomplete");
        }

        QueueOutcome::Scaled {
            snapshot,
            decision,
            change,
        }
    }

    /// Initialize, then pass and sleep until a stop is requested, then shut
    /// down. The sleep is not interrupted; a stop requested during it is
    /// applied when it ends.
    pub async fn run(&mut self) -> Result<(), AutoscalerError> {
        if let Err(e) = self.initialize().await {
            if let Err(close_err) = self.broker.close().await {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %close_err, "Failed to close broker client");
                #[cfg(not(feature = "tracing"))]
                let _ = close_err;
            }
            return Err(e);
        }

        while !self.stop.is_stop_requested() {
            self.tick().await;
            tokio::time::sleep(self.tick_interval).await;
        }

        self.shutdown().await
    }

    /// Drain every worker of every queue and close the broker client.
    pub async fn shutdown(&mut self) -> Result<(), AutoscalerError> {
        self.set_state(AutoscalerState::Stopping);

        #[cfg(feature = "tracing")]
        tracing::info!(workers = self.pool.total_workers(), "Draining all workers");

        let errors = self.pool.drain_all().await;

        #[cfg(feature = "tracing")]
        for e in &errors {
            tracing::warn!(error = %e, "Worker did not stop cleanly");
        }
        #[cfg(not(feature = "tracing"))]
        let _ = errors;

        let closed = self.broker.close().await;
        self.set_state(AutoscalerState::Stopped);

        #[cfg(feature = "tracing")]
        match &closed {
            Ok(()) => tracing::info!("Autoscaler stopped"),
            Err(e) => tracing::error!(error = %e, "Failed to close broker client"),
        }

        closed
    }

    /// Spawn [`run`](Self::run) on the runtime.
    pub fn start(mut self) -> AutoscalerHandle {
        let stop = self.stop_handle();
        let state = self.subscribe();
        let join = tokio::spawn(async move { self.run().await });

        AutoscalerHandle { stop, state, join }
    }

    /// Human-readable summary of policies and live worker counts.
    pub fn status_report(&self) -> String {
        let mut report = format!(
            "Autoscaler Status Report:\n\
             - State: {}\n\
             - Queues: {}\n\
             - Total Workers: {}\n\
             - Tick Interval: {}ms\n\
             - Worker Close Timeout: {}ms\n\n",
            self.state(),
            self.registry.len(),
            self.pool.total_workers(),
            self.tick_interval.as_millis(),
            self.pool.close_timeout().as_millis(),
        );

        for queue in self.registry.iter() {
            report.push_str(&format!(
                "Queue '{}': {} workers (min {}, max {}), lag threshold {}ms, {} jobs per worker\n",
                queue.name,
                self.pool.worker_count(&queue.name),
                queue.min_workers,
                queue.max_workers,
                queue.lag_threshold_ms,
                queue.target_jobs_per_worker
            ));
        }

        report
    }
}

impl fmt::Debug for Autoscaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Autoscaler")
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .field("tick_interval", &self.tick_interval)
            .field("state", &self.state())
            .finish()
    }
}

/// A running control loop.
#[derive(Debug)]
pub struct AutoscalerHandle {
    stop: StopHandle,
    state: watch::Receiver<AutoscalerState>,
    join: JoinHandle<Result<(), AutoscalerError>>,
}

impl AutoscalerHandle {
    pub fn state(&self) -> AutoscalerState {
        *self.state.borrow()
    }

    pub fn stopper(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Wait until the loop reaches `state`. Returns false if the loop exited
    /// without ever reaching it.
    pub async fn wait_for(&mut self, state: AutoscalerState) -> bool {
        self.state.wait_for(|s| *s == state).await.is_ok()
    }

    /// Request a stop and wait for the shutdown sequence to finish.
    pub async fn stop(self) -> Result<(), AutoscalerError> {
        self.stop.stop();
        self.join.await?
    }

    /// Wait for the loop to exit on its own, e.g. after a stop from a
    /// [`StopHandle`].
    pub async fn join(self) -> Result<(), AutoscalerError> {
        self.join.await?
    }
}
