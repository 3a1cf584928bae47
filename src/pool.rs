use crate::events::{ScaleTrigger, ScalingEvent, ScalingEventSink};
use crate::{AutoscalerError, QueueMetricsSnapshot, ScalingDecision, ScalingRule, WorkerHandle, WorkerSpawner};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Result of one resize of a queue's worker list.
#[derive(Debug)]
pub struct PoolChange {
    pub queue: String,
    pub before: usize,
    pub after: usize,
    pub target: usize,
    pub created: usize,
    pub closed: usize,
    /// Workers that could not be created and were not added.
    pub failed_creations: usize,
    /// Creation and close errors; the counts above already reflect them.
    pub failures: Vec<AutoscalerError>,
}

impl PoolChange {
    pub fn is_change(&self) -> bool {
        self.before != self.after
    }
}

/// Live worker handles per queue.
///
/// Mutated only through `&mut self`, so a resize never races another one.
pub struct WorkerPool {
    workers: HashMap<String, Vec<WorkerHandle>>,
    spawner: Arc<dyn WorkerSpawner>,
    sinks: Vec<Arc<dyn ScalingEventSink>>,
    close_timeout: Duration,
}

impl WorkerPool {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, close_timeout: Duration) -> Self {
        Self {
            workers: HashMap::new(),
            spawner,
            sinks: Vec::new(),
            close_timeout,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ScalingEventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_sinks(mut self, sinks: impl IntoIterator<Item = Arc<dyn ScalingEventSink>>) -> Self {
        self.sinks.extend(sinks);
        self
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    pub fn worker_count(&self, queue: &str) -> usize {
        self.workers.get(queue).map(Vec::len).unwrap_or(0)
    }

    pub fn total_workers(&self) -> usize {
        self.workers.values().map(Vec::len).sum()
    }

    /// Ids of the live workers of `queue`, oldest first.
    pub fn worker_ids(&self, queue: &str) -> Vec<String> {
        self.workers
            .get(queue)
            .map(|handles| handles.iter().map(|h| h.id().to_string()).collect())
            .unwrap_or_default()
    }

    /// Resize `queue` to exactly `target` workers.
    pub async fn set_worker_count(
        &mut self,
        queue: &str,
        target: usize,
        trigger: ScaleTrigger,
    ) -> PoolChange {
        self.resize(queue, target, trigger, None, None).await
    }

    /// Apply a decision computed from `snapshot`.
    pub async fn apply(
        &mut self,
        decision: &ScalingDecision,
        snapshot: &QueueMetricsSnapshot,
    ) -> PoolChange {
        self.resize(
            &decision.queue,
            decision.recommended,
            ScaleTrigger::Decision,
            Some(decision.rule),
            Some(snapshot),
        )
        .await
    }

    /// Close every worker of every queue. Returns the close errors.
    pub async fn drain_all(&mut self) -> Vec<AutoscalerError> {
        let mut queues: Vec<String> = self.workers.keys().cloned().collect();
        queues.sort();

        let mut errors = Vec::new();
        for queue in queues {
            let change = self.resize(&queue, 0, ScaleTrigger::Shutdown, None, None).await;
            errors.extend(change.failures);
        }
        self.workers.clear();
        errors
    }

    async fn resize(
        &mut self,
        queue: &str,
        target: usize,
        trigger: ScaleTrigger,
        rule: Option<ScalingRule>,
        snapshot: Option<&QueueMetricsSnapshot>,
    ) -> PoolChange {
        let before = self.worker_count(queue);
        let mut change = PoolChange {
            queue: queue.to_string(),
            before,
            after: before,
            target,
            created: 0,
            closed: 0,
            failed_creations: 0,
            failures: Vec::new(),
        };

        if target > before {
            self.grow(queue, target - before, &mut change).await;
        } else if target < before {
            self.shrink(queue, before - target, &mut change).await;
        }

        change.after = self.worker_count(queue);

        if change.is_change() {
            self.emit(&change, trigger, rule, snapshot);
        }

        change
    }

    async fn grow(&mut self, queue: &str, count: usize, change: &mut PoolChange) {
        for _ in 0..count {
            let worker_id = format!("{}-{}", queue, Uuid::new_v4());

            #[cfg(feature = "tracing")]
            let started = std::time::Instant::now();

            match self.spawner.spawn(queue, worker_id.clone()).await {
                Ok(handle) => {
                    #[cfg(feature = "tracing")]
                    crate::tracing_utils::trace_worker_operation(
                        &worker_id,
                        queue,
                        "create",
                        Some(started.elapsed()),
                        None,
                    );

                    self.workers.entry(queue.to_string()).or_default().push(handle);
                    change.created += 1;
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    crate::tracing_utils::trace_worker_operation(
                        &worker_id,
                        queue,
                        "create",
                        Some(started.elapsed()),
                        Some(&e.to_string()),
                    );

                    let e = match e {
                        AutoscalerError::WorkerLifecycle { .. } => e,
                        other => AutoscalerError::WorkerLifecycle {
                            queue: queue.to_string(),
                            reason: other.to_string(),
                        },
                    };
                    change.failed_creations += 1;
                    change.failures.push(e);
                }
            }
        }
    }

    async fn shrink(&mut self, queue: &str, count: usize, change: &mut PoolChange) {
        let retiring = match self.workers.get_mut(queue) {
            Some(handles) => {
                let keep = handles.len().saturating_sub(count);
                handles.split_off(keep)
            }
            None => Vec::new(),
        };

        let spawner = &self.spawner;
        let timeout = self.close_timeout;

        // Most recently created first; drains run concurrently, each bounded
        // by the close timeout.
        let results = join_all(retiring.into_iter().rev().map(|handle| async move {
            #[cfg(feature = "tracing")]
            let (worker_id, started) = (handle.id().to_string(), std::time::Instant::now());

            let result = spawner.retire(handle, timeout).await;

            #[cfg(feature = "tracing")]
            crate::tracing_utils::trace_worker_operation(
                &worker_id,
                queue,
                "close",
                Some(started.elapsed()),
                result.as_ref().err().map(|e| e.to_string()).as_deref(),
            );

            result
        }))
        .await;

        // A handle is released even when its close failed.
        for result in results {
            change.closed += 1;
            if let Err(e) = result {
                change.failures.push(e);
            }
        }

        if self.workers.get(queue).map_or(false, Vec::is_empty) {
            self.workers.remove(queue);
        }
    }

    fn emit(
        &self,
        change: &PoolChange,
        trigger: ScaleTrigger,
        rule: Option<ScalingRule>,
        snapshot: Option<&QueueMetricsSnapshot>,
    ) {
        if self.sinks.is_empty() {
            return;
        }

        let event = ScalingEvent {
            queue: change.queue.clone(),
            trigger,
            rule,
            before: change.before,
            after: change.after,
            target: change.target,
            failed_creations: change.failed_creations,
            snapshot: snapshot.cloned(),
            timestamp: Utc::now(),
        };

        for sink in &self.sinks {
            sink.emit(&event);
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .workers
            .iter()
            .map(|(queue, handles)| (queue.as_str(), handles.len()))
            .collect();
        f.debug_struct("WorkerPool")
            .field("workers", &counts)
            .field("sinks", &self.sinks.len())
            .field("close_timeout", &self.close_timeout)
            .finish()
    }
}
