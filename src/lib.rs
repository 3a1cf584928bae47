//! # Queue Autoscaler
//!
//! A reactive worker-pool autoscaler for Redis-backed job queues.
//!
//! Every few seconds the control loop reads the backlog of each configured
//! queue, decides how many workers the queue should have and starts or
//! drains workers to match.
//!
//! ## Features
//!
//! - **Per-queue policy**: minimum and maximum workers, lag threshold and
//!   target jobs per worker
//! - **Urgent scale-up** when the oldest waiting job is older than the lag
//!   threshold
//! - **Sticky scale-down**: workers are kept while a backlog remains
//! - **Graceful draining** with a bounded close timeout
//! - **Structured scaling events** for observability pipelines
//! - **Redis broker** and an in-memory broker for tests and embedding
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use queue_autoscaler::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = ConfigBuilder::new()
//!         .redis_url("redis://localhost:6379")
//!         .queue(QueueConfig::new("emails").workers(1, 5))
//!         .build();
//!
//!     let autoscaler = AutoscalerBuilder::new(config)
//!         .handler("emails", handler_fn(|job: Job| async move {
//!             println!("Sending email {}", job.id);
//!             Ok(())
//!         }))
//!         .build()
//!         .await?;
//!
//!     let handle = autoscaler.start();
//!     tokio::signal::ctrl_c().await?;
//!     handle.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! Only one autoscaler instance should manage a given set of queues; running
//! several against the same queues makes them fight over worker counts.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod autoscaler;
pub mod broker;
pub mod collector;
pub mod config;
pub mod decision;
pub mod error;
pub mod events;
pub mod job;
pub mod memory;
pub mod pool;
pub mod queue;
pub mod worker;

#[cfg(feature = "tracing")]
pub mod tracing_utils;

#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;

pub use autoscaler::*;
pub use broker::*;
pub use collector::*;
pub use config::*;
pub use decision::*;
pub use error::*;
pub use events::*;
pub use job::*;
pub use memory::*;
pub use pool::*;
pub use queue::*;
pub use worker::*;

pub mod prelude;

use std::sync::Arc;
use std::time::Duration;

/// Builder for configuring and creating [`Autoscaler`] instances
pub struct AutoscalerBuilder {
    config: AutoscalerConfig,
    handlers: HandlerTable,
    broker: Option<Arc<dyn JobBroker>>,
    spawner: Option<Arc<dyn WorkerSpawner>>,
    sinks: Vec<Arc<dyn ScalingEventSink>>,
    tick_interval: Option<Duration>,
    worker_close_timeout: Option<Duration>,
    worker_poll_timeout: Option<Duration>,
}

impl AutoscalerBuilder {
    /// Create a builder from a loaded configuration
    #[must_use]
    pub fn new(config: AutoscalerConfig) -> Self {
        Self {
            config,
            handlers: HandlerTable::new(),
            broker: None,
            spawner: None,
            sinks: Vec::new(),
            tick_interval: None,
            worker_close_timeout: None,
            worker_poll_timeout: None,
        }
    }

    /// Add a queue, replacing any configured queue with the same name
    #[must_use]
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        match self.config.queues.iter_mut().find(|q| q.name == queue.name) {
            Some(existing) => *existing = queue,
            None => self.config.queues.push(queue),
        }
        self
    }

    /// Replace the whole queue set
    #[must_use]
    pub fn queues(mut self, queues: Vec<QueueConfig>) -> Self {
        self.config.queues = queues;
        self
    }

    /// Register the job handler run by the workers of `queue`
    #[must_use]
    pub fn handler<H>(mut self, queue: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.register(queue, handler);
        self
    }

    /// Use an existing broker instead of connecting to `config.redis`
    #[must_use]
    pub fn broker(mut self, broker: Arc<dyn JobBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Use a custom worker factory; registered handlers are then ignored
    #[must_use]
    pub fn spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Forward scaling events to `sink` in addition to the log
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn ScalingEventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Override the pause between passes
    #[must_use]
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    /// Override the drain bound for a single worker
    #[must_use]
    pub fn worker_close_timeout(mut self, timeout: Duration) -> Self {
        self.worker_close_timeout = Some(timeout);
        self
    }

    /// Override how long idle workers block waiting for a job
    #[must_use]
    pub fn worker_poll_timeout(mut self, timeout: Duration) -> Self {
        self.worker_poll_timeout = Some(timeout);
        self
    }

    /// Build the [`Autoscaler`]
    ///
    /// # Errors
    /// Returns `AutoscalerError::ConfigInvalid` for an invalid queue set, a
    /// queue without a handler or a close timeout not above the poll timeout,
    /// and a Redis error when no broker was given
    /// and the connection fails.
    pub async fn build(self) -> Result<Autoscaler, AutoscalerError> {
        let registry = self.config.registry()?;

        let broker: Arc<dyn JobBroker> = match self.broker {
            Some(broker) => broker,
            None => {
                self.config.validate()?;
                let broker =
                    RedisBroker::new_with_config(&self.config.redis.url, self.config.redis.pool_size)
                        .await?
                        .with_completed_retention(self.config.redis.completed_retention);
                Arc::new(broker)
            }
        };

        let close_timeout = self
            .worker_close_timeout
            .unwrap_or_else(|| self.config.control.worker_close_timeout());

        let spawner: Arc<dyn WorkerSpawner> = match self.spawner {
            Some(spawner) => spawner,
            None => {
                self.handlers.ensure_covers(&registry)?;
                let poll_timeout = self
                    .worker_poll_timeout
                    .unwrap_or_else(|| self.config.control.worker_poll_timeout());
                ensure_close_outlasts_poll(close_timeout, poll_timeout)?;
                Arc::new(BrokerWorkerSpawner::new(broker.clone(), self.handlers, poll_timeout))
            }
        };

        let mut pool = WorkerPool::new(spawner, close_timeout);
        #[cfg(feature = "tracing")]
        {
            pool = pool.with_sink(Arc::new(TracingEventSink));
        }
        pool = pool.with_sinks(self.sinks);

        let tick_interval = self
            .tick_interval
            .unwrap_or_else(|| self.config.control.tick_interval());

        Ok(Autoscaler::new(registry, broker, pool, tick_interval))
    }
}
