use crate::{AutoscalerError, QueueRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

pub type JobId = Uuid;

/// A unit of background work as stored by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    /// Set by the broker when a worker picks the job up.
    pub started_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(queue: impl Into<String>, name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            name: name.into(),
            payload,
            enqueued_at: Utc::now(),
            started_at: None,
        }
    }

    /// Same job with an explicit enqueue time.
    #[must_use]
    pub fn enqueued_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueued_at = at;
        self
    }
}

/// Peek view of a waiting job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitingJobInfo {
    pub id: JobId,
    pub enqueued_at: DateTime<Utc>,
}

/// Timing record of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedJobInfo {
    pub id: JobId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CompletedJobInfo {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJobInfo {
    pub id: JobId,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
}

/// Result type for job execution
pub type JobResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Business logic run by a worker for every job of its queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobResult;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    async fn handle(&self, job: &Job) -> JobResult {
        (self.f)(job.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    FnHandler { f }
}

/// Per-queue handler table, populated once before the autoscaler starts.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `queue`, replacing any previous one.
    pub fn register<H>(&mut self, queue: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(queue.into(), Arc::new(handler));
    }

    pub fn register_arc(&mut self, queue: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(queue.into(), handler);
    }

    pub fn get(&self, queue: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(queue).cloned()
    }

    pub fn contains(&self, queue: &str) -> bool {
        self.handlers.contains_key(queue)
    }

    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every configured queue needs a handler before any worker is created.
    pub fn ensure_covers(&self, registry: &QueueRegistry) -> Result<(), AutoscalerError> {
        let missing: Vec<String> = registry
            .iter()
            .filter(|q| !self.contains(&q.name))
            .map(|q| q.name.clone())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(AutoscalerError::ConfigInvalid(format!(
                "No job handler registered for queue(s): {}",
                missing.join(", ")
            )))
        }
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("queues", &self.queues())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueueConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_handler_fn_runs_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |job: Job| {
            let counter = counter.clone();
            async move {
                assert_eq!(job.name, "send_email");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let job = Job::new("emails", "send_email", vec![]);
        handler.handle(&job).await.unwrap();
        handler.handle(&job).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handler_table_reports_missing_queues() {
        let registry = QueueRegistry::new(vec![
            QueueConfig::new("emails"),
            QueueConfig::new("search"),
            QueueConfig::new("billing"),
        ])
        .unwrap();

        let mut table = HandlerTable::new();
        table.register("emails", handler_fn(|_job: Job| async { Ok(()) }));

        let err = table.ensure_covers(&registry).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("search"));
        assert!(message.contains("billing"));
        assert!(!message.contains("emails"));

        table.register("search", handler_fn(|_job: Job| async { Ok(()) }));
        table.register("billing", handler_fn(|_job: Job| async { Ok(()) }));
        assert!(table.ensure_covers(&registry).is_ok());
        assert_eq!(table.queues(), vec!["billing", "emails", "search"]);
    }

    #[test]
    fn test_completed_job_duration() {
        let started_at = Utc::now();
        let info = CompletedJobInfo {
            id: Uuid::new_v4(),
            started_at,
            finished_at: started_at + chrono::Duration::milliseconds(1500),
        };
        assert_eq!(info.duration_ms(), 1500);
    }
}
