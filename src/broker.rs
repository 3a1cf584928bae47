use crate::{AutoscalerError, CompletedJobInfo, FailedJobInfo, Job, JobId, WaitingJobInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use redis::AsyncCommands;
use std::time::Duration;

/// Number of completed/failed records kept per queue.
pub const DEFAULT_COMPLETED_RETENTION: usize = 1000;

/// Job broker seen by the autoscaler and its workers.
///
/// The read side (`get_*`) must never mutate broker state; it is what the
/// metrics collector uses every tick. The worker side moves jobs through
/// waiting -> active -> completed/failed.
#[async_trait]
pub trait JobBroker: Send + Sync {
    async fn get_waiting_count(&self, queue: &str) -> Result<u64, AutoscalerError>;

    async fn get_active_count(&self, queue: &str) -> Result<u64, AutoscalerError>;

    async fn get_completed_count(&self, queue: &str) -> Result<u64, AutoscalerError>;

    async fn get_failed_count(&self, queue: &str) -> Result<u64, AutoscalerError>;

    /// Waiting jobs, oldest first.
    async fn get_waiting(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<WaitingJobInfo>, AutoscalerError>;

    /// Completed jobs, most recent first.
    async fn get_completed(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CompletedJobInfo>, AutoscalerError>;

    async fn enqueue(&self, queue: &str, job: Job) -> Result<JobId, AutoscalerError>;

    /// Take the oldest waiting job and mark it active, waiting up to `wait`
    /// for one to arrive.
    async fn fetch_next(&self, queue: &str, wait: Duration) -> Result<Option<Job>, AutoscalerError>;

    async fn complete(&self, job: &Job) -> Result<(), AutoscalerError>;

    async fn fail(&self, job: &Job, reason: &str) -> Result<(), AutoscalerError>;

    async fn register_worker(&self, _queue: &str, _worker_id: &str) -> Result<(), AutoscalerError> {
        Ok(())
    }

    async fn unregister_worker(&self, _queue: &str, _worker_id: &str) -> Result<(), AutoscalerError> {
        Ok(())
    }

    async fn heartbeat(&self, _worker_id: &str) -> Result<(), AutoscalerError> {
        Ok(())
    }

    /// Release client connections. Called once during shutdown.
    async fn close(&self) -> Result<(), AutoscalerError> {
        Ok(())
    }
}

mod keys {
    pub fn waiting(queue: &str) -> String {
        format!("queue:{}:waiting", queue)
    }

    pub fn active(queue: &str) -> String {
        format!("queue:{}:active", queue)
    }

    pub fn completed(queue: &str) -> String {
        format!("queue:{}:completed", queue)
    }

    pub fn failed(queue: &str) -> String {
        format!("queue:{}:failed", queue)
    }

    pub fn started(queue: &str) -> String {
        format!("queue:{}:started", queue)
    }

    pub fn workers(queue: &str) -> String {
        format!("queue:{}:workers", queue)
    }

    pub fn job(id: &str) -> String {
        format!("job:{}", id)
    }

    pub fn heartbeat(worker_id: &str) -> String {
        format!("worker:{}:heartbeat", worker_id)
    }
}

/// Redis-backed broker.
///
/// Waiting and active sets are lists of job ids (oldest at the head of
/// `waiting`); job bodies live under `job:{id}` as MessagePack. Completed and
/// failed records are pushed to the head of capped lists, so their lengths
/// are "recent" counts.
pub struct RedisBroker {
    pub(crate) pool: Pool,
    completed_retention: usize,
}

impl RedisBroker {
    pub async fn new(redis_url: &str) -> Result<Self, AutoscalerError> {
        Self::new_with_config(redis_url, None).await
    }

    pub async fn new_with_config(redis_url: &str, pool_size: Option<usize>) -> Result<Self, AutoscalerError> {
        let mut cfg = Config::from_url(redis_url);
        if let Some(size) = pool_size {
            cfg.pool = Some(PoolConfig::new(size));
        }

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| AutoscalerError::Connection(format!("Failed to create Redis pool: {}", e)))?;

        // Test the connection
        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async::<_, String>(&mut *conn).await?;

        Ok(Self {
            pool,
            completed_retention: DEFAULT_COMPLETED_RETENTION,
        })
    }

    #[must_use]
    pub fn with_completed_retention(mut self, retention: usize) -> Self {
        self.completed_retention = retention.max(1);
        self
    }

    async fn get_connection(&self) -> Result<deadpool_redis::Connection, AutoscalerError> {
        self.pool
            .get()
            .await
            .map_err(|e| AutoscalerError::Connection(format!("Failed to get Redis connection: {}", e)))
    }

    async fn list_len(&self, key: &str) -> Result<u64, AutoscalerError> {
        let mut conn = self.get_connection().await?;
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    /// Id range for LRANGE; `None` when the window is empty.
    fn range(offset: usize, limit: usize) -> Option<(isize, isize)> {
        if limit == 0 {
            return None;
        }
        let start = offset as isize;
        Some((start, start + limit as isize - 1))
    }

    async fn load_jobs(
        conn: &mut deadpool_redis::Connection,
        ids: &[String],
    ) -> Result<Vec<Job>, AutoscalerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let job_keys: Vec<String> = ids.iter().map(|id| keys::job(id)).collect();
        let bodies: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(&job_keys)
            .query_async(conn)
            .await?;

        let mut jobs = Vec::with_capacity(bodies.len());
        for body in bodies.into_iter().flatten() {
            jobs.push(rmp_serde::from_slice::<Job>(&body)?);
        }
        Ok(jobs)
    }

    async fn record_started(
        conn: &mut deadpool_redis::Connection,
        queue: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AutoscalerError> {
        conn.hset::<_, _, _, ()>(keys::started(queue), id, at.timestamp_millis())
            .await?;
        Ok(())
    }

    /// Ids of workers currently registered for `queue`.
    pub async fn get_registered_workers(&self, queue: &str) -> Result<Vec<String>, AutoscalerError> {
        let mut conn = self.get_connection().await?;
        let workers: Vec<String> = conn.smembers(keys::workers(queue)).await?;
        Ok(workers)
    }

    /// Most recent failure records for `queue`.
    pub async fn get_failed(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<FailedJobInfo>, AutoscalerError> {
        let Some((start, stop)) = Self::range(offset, limit) else {
            return Ok(Vec::new());
        };
        let mut conn = self.get_connection().await?;
        let raw: Vec<Vec<u8>> = conn.lrange(keys::failed(queue), start, stop).await?;
        let mut records = Vec::with_capacity(raw.len());
        for entry in raw {
            records.push(rmp_serde::from_slice(&entry)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl JobBroker for RedisBroker {
    async fn get_waiting_count(&self, queue: &str) -> Result<u64, AutoscalerError> {
        self.list_len(&keys::waiting(queue)).await
    }

    async fn get_active_count(&self, queue: &str) -> Result<u64, AutoscalerError> {
        self.list_len(&keys::active(queue)).await
    }

    async fn get_completed_count(&self, queue: &str) -> Result<u64, AutoscalerError> {
        self.list_len(&keys::completed(queue)).await
    }

    async fn get_failed_count(&self, queue: &str) -> Result<u64, AutoscalerError> {
        self.list_len(&keys::failed(queue)).await
    }

    async fn get_waiting(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<WaitingJobInfo>, AutoscalerError> {
        let Some((start, stop)) = Self::range(offset, limit) else {
            return Ok(Vec::new());
        };

        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn.lrange(keys::waiting(queue), start, stop).await?;
        let jobs = Self::load_jobs(&mut conn, &ids).await?;

        Ok(jobs
            .into_iter()
            .map(|job| WaitingJobInfo {
                id: job.id,
                enqueued_at: job.enqueued_at,
            })
            .collect())
    }

    async fn get_completed(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CompletedJobInfo>, AutoscalerError> {
        let Some((start, stop)) = Self::range(offset, limit) else {
            return Ok(Vec::new());
        };

        let mut conn = self.get_connection().await?;
        let raw: Vec<Vec<u8>> = conn.lrange(keys::completed(queue), start, stop).await?;
        let mut records = Vec::with_capacity(raw.len());
        for entry in raw {
            records.push(rmp_serde::from_slice(&entry)?);
        }
        Ok(records)
    }

    async fn enqueue(&self, queue: &str, mut job: Job) -> Result<JobId, AutoscalerError> {
        job.queue = queue.to_string();
        let id = job.id.to_string();
        let body = rmp_serde::to_vec(&job)?;

        let mut conn = self.get_connection().await?;
        redis::pipe()
            .atomic()
            .set(keys::job(&id), body)
            .ignore()
            .rpush(keys::waiting(queue), &id)
            .ignore()
            .query_async::<_, ()>(&mut *conn)
            .await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(queue = queue, job_id = %job.id, job_name = %job.name, "Enqueued job");

        Ok(job.id)
    }

    async fn fetch_next(&self, queue: &str, wait: Duration) -> Result<Option<Job>, AutoscalerError> {
        let mut conn = self.get_connection().await?;

        // BLMOVE keeps the id in exactly one of the two lists at all times.
        let moved: Option<String> = redis::cmd("BLMOVE")
            .arg(keys::waiting(queue))
            .arg(keys::active(queue))
            .arg("LEFT")
            .arg("RIGHT")
            .arg(wait.as_secs_f64())
            .query_async(&mut *conn)
            .await?;

        let Some(id) = moved else {
            return Ok(None);
        };

        let started_at = Utc::now();
        Self::record_started(&mut conn, queue, &id, started_at).await?;

        let mut jobs = Self::load_jobs(&mut conn, std::slice::from_ref(&id)).await?;
        match jobs.pop() {
            Some(mut job) => {
                job.started_at = Some(started_at);
                Ok(Some(job))
            }
            None => {
                // Body expired or was deleted; drop the orphaned id.
                redis::pipe()
                    .lrem(keys::active(queue), 1, &id)
                    .ignore()
                    .hdel(keys::started(queue), &id)
                    .ignore()
                    .query_async::<_, ()>(&mut *conn)
                    .await?;
                Err(AutoscalerError::Broker(format!(
                    "Job {} on queue '{}' has no stored body",
                    id, queue
                )))
            }
        }
    }

    async fn complete(&self, job: &Job) -> Result<(), AutoscalerError> {
        let id = job.id.to_string();
        let record = CompletedJobInfo {
            id: job.id,
            started_at: job.started_at.unwrap_or(job.enqueued_at),
            finished_at: Utc::now(),
        };
        let retention = self.completed_retention as isize;

        let mut conn = self.get_connection().await?;
        redis::pipe()
            .atomic()
            .lrem(keys::active(&job.queue), 1, &id)
            .ignore()
            .hdel(keys::started(&job.queue), &id)
            .ignore()
            .lpush(keys::completed(&job.queue), rmp_serde::to_vec(&record)?)
            .ignore()
            .ltrim(keys::completed(&job.queue), 0, retention - 1)
            .ignore()
            .del(keys::job(&id))
            .ignore()
            .query_async::<_, ()>(&mut *conn)
            .await?;

        Ok(())
    }

    async fn fail(&self, job: &Job, reason: &str) -> Result<(), AutoscalerError> {
        let id = job.id.to_string();
        let record = FailedJobInfo {
            id: job.id,
            failed_at: Utc::now(),
            reason: reason.to_string(),
        };
        let retention = self.completed_retention as isize;

        let mut conn = self.get_connection().await?;
        redis::pipe()
            .atomic()
            .lrem(keys::active(&job.queue), 1, &id)
            .ignore()
            .hdel(keys::started(&job.queue), &id)
            .ignore()
            .lpush(keys::failed(&job.queue), rmp_serde::to_vec(&record)?)
            .ignore()
            .ltrim(keys::failed(&job.queue), 0, retention - 1)
            .ignore()
            .del(keys::job(&id))
            .ignore()
            .query_async::<_, ()>(&mut *conn)
            .await?;

        #[cfg(feature = "tracing")]
        tracing::warn!(
            queue = %job.queue,
            job_id = %job.id,
            reason = reason,
            "Job marked as failed"
        );

        Ok(())
    }

    async fn register_worker(&self, queue: &str, worker_id: &str) -> Result<(), AutoscalerError> {
        let mut conn = self.get_connection().await?;
        conn.sadd::<_, _, ()>(keys::workers(queue), worker_id).await?;
        conn.set::<_, _, ()>(keys::heartbeat(worker_id), Utc::now().timestamp())
            .await?;
        Ok(())
    }

    async fn unregister_worker(&self, queue: &str, worker_id: &str) -> Result<(), AutoscalerError> {
        let mut conn = self.get_connection().await?;
        conn.srem::<_, _, ()>(keys::workers(queue), worker_id).await?;
        conn.del::<_, ()>(keys::heartbeat(worker_id)).await?;
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<(), AutoscalerError> {
        let mut conn = self.get_connection().await?;
        conn.set::<_, _, ()>(keys::heartbeat(worker_id), Utc::now().timestamp())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), AutoscalerError> {
        self.pool.close();

        #[cfg(feature = "tracing")]
        tracing::info!("Redis broker connections closed");

        Ok(())
    }
}
