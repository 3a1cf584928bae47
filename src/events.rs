//! Structured scaling events for external observability pipelines.

use crate::{QueueMetricsSnapshot, ScalingRule};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// What caused a pool mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleTrigger {
    Initialization,
    Decision,
    Shutdown,
}

/// One applied change of a queue's worker count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub queue: String,
    pub trigger: ScaleTrigger,
    pub rule: Option<ScalingRule>,
    pub before: usize,
    pub after: usize,
    pub target: usize,
    pub failed_creations: usize,
    pub snapshot: Option<QueueMetricsSnapshot>,
    pub timestamp: DateTime<Utc>,
}

impl ScalingEvent {
    pub fn delta(&self) -> i64 {
        self.after as i64 - self.before as i64
    }
}

/// Receives every [`ScalingEvent`]. Implementations must not block.
pub trait ScalingEventSink: Send + Sync {
    fn emit(&self, event: &ScalingEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl ScalingEventSink for NoopEventSink {
    fn emit(&self, _event: &ScalingEvent) {}
}

/// Logs each event as a structured `tracing` record.
#[cfg(feature = "tracing")]
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[cfg(feature = "tracing")]
impl ScalingEventSink for TracingEventSink {
    fn emit(&self, event: &ScalingEvent) {
        let (waiting, active, lag_ms, avg_ms) = event
            .snapshot
            .as_ref()
            .map(|s| (s.waiting_jobs, s.active_jobs, s.lag_ms, s.avg_job_duration_ms))
            .unwrap_or_default();

        tracing::info!(
            queue = %event.queue,
            trigger = ?event.trigger,
            rule = event.rule.map(|r| r.to_string()).as_deref(),
            before = event.before,
            after = event.after,
            target = event.target,
            failed_creations = event.failed_creations,
            waiting_jobs = waiting,
            active_jobs = active,
            lag_ms = lag_ms,
            avg_job_duration_ms = avg_ms,
            event = "scaling",
            "Worker pool scaled"
        );
    }
}

/// Forwards events over an unbounded channel, e.g. to a metrics exporter.
/// Events are dropped silently once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<ScalingEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScalingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ScalingEventSink for ChannelEventSink {
    fn emit(&self, event: &ScalingEvent) {
        let _ = self.tx.send(event.clone());
    }
}
