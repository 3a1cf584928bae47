//! In-process [`JobBroker`] used by the test suites and by embedders that
//! want the autoscaler without Redis.

use crate::{AutoscalerError, CompletedJobInfo, FailedJobInfo, Job, JobBroker, JobId, WaitingJobInfo};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct MemoryQueue {
    waiting: VecDeque<Job>,
    active: HashMap<JobId, Job>,
    completed: VecDeque<CompletedJobInfo>,
    failed: VecDeque<FailedJobInfo>,
    workers: HashSet<String>,
    unreachable: bool,
}

pub struct MemoryBroker {
    queues: DashMap<String, MemoryQueue>,
    job_arrived: Notify,
    retention: usize,
    closed: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            job_arrived: Notify::new(),
            retention: crate::broker::DEFAULT_COMPLETED_RETENTION,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    /// Make every call touching `queue` fail, as if the broker were down.
    pub fn set_unreachable(&self, queue: &str, unreachable: bool) {
        self.queues.entry(queue.to_string()).or_default().unreachable = unreachable;
    }

    /// Put a job straight into the active set without a worker.
    pub fn seed_active(&self, queue: &str, mut job: Job) {
        job.queue = queue.to_string();
        job.started_at.get_or_insert_with(Utc::now);
        self.queues
            .entry(queue.to_string())
            .or_default()
            .active
            .insert(job.id, job);
    }

    /// Record a finished job with explicit timings.
    pub fn seed_completed(&self, queue: &str, record: CompletedJobInfo) {
        let retention = self.retention;
        let mut entry = self.queues.entry(queue.to_string()).or_default();
        entry.completed.push_front(record);
        entry.completed.truncate(retention);
    }

    /// Whether [`JobBroker::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn registered_workers(&self, queue: &str) -> Vec<String> {
        let mut workers: Vec<String> = self
            .queues
            .get(queue)
            .map(|q| q.workers.iter().cloned().collect())
            .unwrap_or_default();
        workers.sort();
        workers
    }

    pub fn active_jobs(&self, queue: &str) -> usize {
        self.queues.get(queue).map(|q| q.active.len()).unwrap_or(0)
    }

    pub fn failed_jobs(&self, queue: &str) -> Vec<FailedJobInfo> {
        self.queues
            .get(queue)
            .map(|q| q.failed.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn with_queue<T>(
        &self,
        queue: &str,
        f: impl FnOnce(&mut MemoryQueue) -> T,
    ) -> Result<T, AutoscalerError> {
        let mut entry = self.queues.entry(queue.to_string()).or_default();
        if entry.unreachable {
            return Err(AutoscalerError::Connection(format!(
                "Broker unreachable for queue '{}'",
                queue
            )));
        }
        Ok(f(entry.value_mut()))
    }
}

#[async_trait]
impl JobBroker for MemoryBroker {
    async fn get_waiting_count(&self, queue: &str) -> Result<u64, AutoscalerError> {
        self.with_queue(queue, |q| q.waiting.len() as u64)
    }

    async fn get_active_count(&self, queue: &str) -> Result<u64, AutoscalerError> {
        self.with_queue(queue, |q| q.active.len() as u64)
    }

    async fn get_completed_count(&self, queue: &str) -> Result<u64, AutoscalerError> {
        self.with_queue(queue, |q| q.completed.len() as u64)
    }

    async fn get_failed_count(&self, queue: &str) -> Result<u64, AutoscalerError> {
        self.with_queue(queue, |q| q.failed.len() as u64)
    }

    async fn get_waiting(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<WaitingJobInfo>, AutoscalerError> {
        self.with_queue(queue, |q| {
            q.waiting
                .iter()
                .skip(offset)
                .take(limit)
                .map(|job| WaitingJobInfo {
                    id: job.id,
                    enqueued_at: job.enqueued_at,
                })
                .collect()
        })
    }

    async fn get_completed(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CompletedJobInfo>, AutoscalerError> {
        self.with_queue(queue, |q| {
            q.completed.iter().skip(offset).take(limit).cloned().collect()
        })
    }

    async fn enqueue(&self, queue: &str, mut job: Job) -> Result<JobId, AutoscalerError> {
        job.queue = queue.to_string();
        let id = job.id;
        self.with_queue(queue, |q| q.waiting.push_back(job))?;
        self.job_arrived.notify_waiters();
        Ok(id)
    }

    async fn fetch_next(&self, queue: &str, wait: Duration) -> Result<Option<Job>, AutoscalerError> {
        // Registered before the check so a concurrent enqueue cannot slip
        // between the empty check and the wait.
        let arrived = self.job_arrived.notified();

        let take = |q: &mut MemoryQueue| {
            q.waiting.pop_front().map(|mut job| {
                job.started_at = Some(Utc::now());
                q.active.insert(job.id, job.clone());
                job
            })
        };

        if let Some(job) = self.with_queue(queue, take)? {
            return Ok(Some(job));
        }

        if tokio::time::timeout(wait, arrived).await.is_err() {
            return Ok(None);
        }

        self.with_queue(queue, take)
    }

    async fn complete(&self, job: &Job) -> Result<(), AutoscalerError> {
        let retention = self.retention;
        self.with_queue(&job.queue, |q| {
            q.active.remove(&job.id);
            q.completed.push_front(CompletedJobInfo {
                id: job.id,
                started_at: job.started_at.unwrap_or(job.enqueued_at),
                finished_at: Utc::now(),
            });
            q.completed.truncate(retention);
        })
    }

    async fn fail(&self, job: &Job, reason: &str) -> Result<(), AutoscalerError> {
        let retention = self.retention;
        self.with_queue(&job.queue, |q| {
            q.active.remove(&job.id);
            q.failed.push_front(FailedJobInfo {
                id: job.id,
                failed_at: Utc::now(),
                reason: reason.to_string(),
            });
            q.failed.truncate(retention);
        })
    }

    async fn register_worker(&self, queue: &str, worker_id: &str) -> Result<(), AutoscalerError> {
        self.with_queue(queue, |q| {
            q.workers.insert(worker_id.to_string());
        })
    }

    async fn unregister_worker(&self, queue: &str, worker_id: &str) -> Result<(), AutoscalerError> {
        self.with_queue(queue, |q| {
            q.workers.remove(worker_id);
        })
    }

    async fn close(&self) -> Result<(), AutoscalerError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_and_state_transitions() {
        let broker = MemoryBroker::new();
        let first = broker.enqueue("q", Job::new("q", "a", vec![])).await.unwrap();
        broker.enqueue("q", Job::new("q", "b", vec![])).await.unwrap();

        let waiting = broker.get_waiting("q", 0, 1).await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, first);

        let job = broker
            .fetch_next("q", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, first);
        assert!(job.started_at.is_some());
        assert_eq!(broker.get_waiting_count("q").await.unwrap(), 1);
        assert_eq!(broker.get_active_count("q").await.unwrap(), 1);

        broker.complete(&job).await.unwrap();
        assert_eq!(broker.get_active_count("q").await.unwrap(), 0);
        assert_eq!(broker.get_completed_count("q").await.unwrap(), 1);

        let job = broker
            .fetch_next("q", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        broker.fail(&job, "boom").await.unwrap();
        assert_eq!(broker.get_failed_count("q").await.unwrap(), 1);
        assert_eq!(broker.failed_jobs("q")[0].reason, "boom");
    }

    #[tokio::test]
    async fn test_fetch_times_out_on_empty_queue() {
        let broker = MemoryBroker::new();
        let fetched = broker.fetch_next("empty", Duration::from_millis(20)).await.unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_enqueue() {
        let broker = Arc::new(MemoryBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.fetch_next("q", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.enqueue("q", Job::new("q", "late", vec![])).await.unwrap();

        let fetched = waiter.await.unwrap().unwrap();
        assert_eq!(fetched.map(|job| job.name), Some("late".to_string()));
    }

    #[tokio::test]
    async fn test_unreachable_queue_fails_only_that_queue() {
        let broker = MemoryBroker::new();
        broker.set_unreachable("down", true);

        assert!(broker.get_waiting_count("down").await.is_err());
        assert_eq!(broker.get_waiting_count("up").await.unwrap(), 0);

        broker.set_unreachable("down", false);
        assert_eq!(broker.get_waiting_count("down").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_completed_retention_is_capped() {
        let broker = MemoryBroker::new().with_retention(3);
        for _ in 0..5 {
            let now = Utc::now();
            broker.seed_completed(
                "q",
                CompletedJobInfo {
                    id: uuid::Uuid::new_v4(),
                    started_at: now,
                    finished_at: now,
                },
            );
        }
        assert_eq!(broker.get_completed_count("q").await.unwrap(), 3);
    }
}
