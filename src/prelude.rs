//! Convenience re-exports for common types and traits
//!
//! Users can import everything they need with `use queue_autoscaler::prelude::*;`

// Core types and traits
pub use crate::{
    handler_fn, Autoscaler, AutoscalerBuilder, AutoscalerError, AutoscalerHandle, AutoscalerState,
    BrokerWorkerSpawner, HandlerTable, Job, JobBroker, JobHandler, JobId, JobResult, MemoryBroker,
    PassReport, QueueConfig, QueueMetricsCollector, QueueMetricsSnapshot, QueueOutcome,
    QueueRegistry, RedisBroker, ScalingAction, ScalingDecision, ScalingRule, StopHandle,
    WorkerHandle, WorkerPool, WorkerSpawner, WorkerState,
};

// Scaling events
pub use crate::{ChannelEventSink, NoopEventSink, ScaleTrigger, ScalingEvent, ScalingEventSink};

#[cfg(feature = "tracing")]
pub use crate::TracingEventSink;

// Configuration types
pub use crate::{AutoscalerConfig, ConfigBuilder, ControlLoopConfig, RedisConfig};

// Async trait for JobHandler implementations
pub use async_trait::async_trait;

// Date/time handling for job timestamps
pub use chrono::{DateTime, Utc};

// UUID handling for job IDs
pub use uuid::Uuid;

#[cfg(feature = "tracing")]
pub use crate::tracing_utils::{trace_worker_operation, PerformanceTracker};
