use crate::{AutoscalerError, JobBroker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Completed jobs averaged for `avg_job_duration_ms`.
pub const DURATION_SAMPLE_SIZE: usize = 10;

/// Reported average when no completed job is available.
pub const FALLBACK_AVG_DURATION_MS: f64 = 1000.0;

/// Point-in-time view of one queue, rebuilt every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetricsSnapshot {
    pub queue: String,
    pub waiting_jobs: u64,
    pub active_jobs: u64,
    pub completed_recent: u64,
    pub failed_recent: u64,
    /// Age of the oldest waiting job; 0 when nothing waits.
    pub lag_ms: u64,
    /// Informational only; the scaling decision does not read it.
    pub avg_job_duration_ms: f64,
    pub current_workers: usize,
    pub collected_at: DateTime<Utc>,
}

impl QueueMetricsSnapshot {
    /// Snapshot with every counter at zero.
    pub fn empty(queue: impl Into<String>, current_workers: usize) -> Self {
        Self {
            queue: queue.into(),
            waiting_jobs: 0,
            active_jobs: 0,
            completed_recent: 0,
            failed_recent: 0,
            lag_ms: 0,
            avg_job_duration_ms: FALLBACK_AVG_DURATION_MS,
            current_workers,
            collected_at: Utc::now(),
        }
    }

    pub fn backlog(&self) -> u64 {
        self.waiting_jobs.saturating_add(self.active_jobs)
    }
}

/// Reads live queue state from the broker. Never mutates it.
#[derive(Clone)]
pub struct QueueMetricsCollector {
    broker: Arc<dyn JobBroker>,
}

impl QueueMetricsCollector {
    pub fn new(broker: Arc<dyn JobBroker>) -> Self {
        Self { broker }
    }

    pub async fn collect(
        &self,
        queue: &str,
        current_workers: usize,
    ) -> Result<QueueMetricsSnapshot, AutoscalerError> {
        self.collect_at(queue, current_workers, Utc::now()).await
    }

    /// Like [`collect`](Self::collect) with an explicit clock.
    pub async fn collect_at(
        &self,
        queue: &str,
        current_workers: usize,
        now: DateTime<Utc>,
    ) -> Result<QueueMetricsSnapshot, AutoscalerError> {
        self.read_snapshot(queue, current_workers, now)
            .await
            .map_err(|e| match e {
                AutoscalerError::MetricsUnavailable { .. } => e,
                other => AutoscalerError::MetricsUnavailable {
                    queue: queue.to_string(),
                    reason: other.to_string(),
                },
            })
    }

    async fn read_snapshot(
        &self,
        queue: &str,
        current_workers: usize,
        now: DateTime<Utc>,
    ) -> Result<QueueMetricsSnapshot, AutoscalerError> {
        let waiting_jobs = self.broker.get_waiting_count(queue).await?;
        let active_jobs = self.broker.get_active_count(queue).await?;
        let completed_recent = self.broker.get_completed_count(queue).await?;
        let failed_recent = self.broker.get_failed_count(queue).await?;

        let lag_ms = if waiting_jobs == 0 {
            0
        } else {
            let oldest = self.broker.get_waiting(queue, 0, 1).await?;
            oldest
                .first()
                .map(|job| (now - job.enqueued_at).num_milliseconds().max(0) as u64)
                .unwrap_or(0)
        };

        let samples = self
            .broker
            .get_completed(queue, 0, DURATION_SAMPLE_SIZE)
            .await?;
        let avg_job_duration_ms = average_duration_ms(samples.iter().map(|s| s.duration_ms()));

        Ok(QueueMetricsSnapshot {
            queue: queue.to_string(),
            waiting_jobs,
            active_jobs,
            completed_recent,
            failed_recent,
            lag_ms,
            avg_job_duration_ms,
            current_workers,
            collected_at: now,
        })
    }
}

/// Mean of the given durations, or the fallback when there are none.
/// Negative durations (clock skew between hosts) count as zero.
fn average_duration_ms(durations: impl Iterator<Item = i64>) -> f64 {
    let (count, total) = durations.fold((0u64, 0i64), |(count, total), d| {
        (count + 1, total + d.max(0))
    });

    if count == 0 {
        FALLBACK_AVG_DURATION_MS
    } else {
        total as f64 / count as f64
    }
}
