use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutoscalerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Metrics unavailable for queue '{queue}': {reason}")]
    MetricsUnavailable { queue: String, reason: String },

    #[error("Worker lifecycle error on queue '{queue}': {reason}")]
    WorkerLifecycle { queue: String, reason: String },

    #[error("Worker {worker_id} did not drain within {timeout_ms}ms and was aborted")]
    ShutdownTimeout { worker_id: String, timeout_ms: u64 },

    #[error("Control loop task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
