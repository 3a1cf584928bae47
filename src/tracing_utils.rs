//! Tracing helpers shared by the control loop and the worker pool.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Simple performance tracker for measuring operation durations
pub struct PerformanceTracker {
    start_time: Instant,
    operation_name: String,
    context: HashMap<String, String>,
}

impl PerformanceTracker {
    pub fn new(operation_name: &str) -> Self {
        Self {
            start_time: Instant::now(),
            operation_name: operation_name.to_string(),
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, key: &str, value: impl ToString) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }

    pub fn add_context(&mut self, key: &str, value: impl ToString) {
        self.context.insert(key.to_string(), value.to_string());
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn trace_completion(self) {
        let duration = self.elapsed();
        tracing::debug!(
            operation = self.operation_name,
            duration_ms = duration.as_millis() as u64,
            context = ?self.context,
            "Operation completed"
        );
    }

    pub fn trace_completion_with_result<T, E>(self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        let duration = self.elapsed();
        match result {
            Ok(_) => {
                tracing::info!(
                    operation = self.operation_name,
                    duration_ms = duration.as_millis() as u64,
                    success = true,
                    context = ?self.context,
                    "Operation completed successfully"
                );
            }
            Err(e) => {
                tracing::error!(
                    operation = self.operation_name,
                    duration_ms = duration.as_millis() as u64,
                    success = false,
                    error = %e,
                    context = ?self.context,
                    "Operation failed"
                );
            }
        }
    }
}

/// Trace a worker create/close with its outcome
pub fn trace_worker_operation(
    worker_id: &str,
    queue: &str,
    operation: &str,
    duration: Option<Duration>,
    error: Option<&str>,
) {
    match error {
        None => {
            tracing::debug!(
                worker_id = worker_id,
                queue = queue,
                operation = operation,
                duration_ms = duration.map(|d| d.as_millis() as u64),
                success = true,
                "Worker operation completed"
            );
        }
        Some(error) => {
            tracing::error!(
                worker_id = worker_id,
                queue = queue,
                operation = operation,
                duration_ms = duration.map(|d| d.as_millis() as u64),
                success = false,
                error = error,
                "Worker operation failed"
            );
        }
    }
}

/// Helper macro for timing operations with automatic tracing
#[macro_export]
macro_rules! timed_operation {
    ($operation_name:expr, $code:expr) => {{
        let tracker = $crate::tracing_utils::PerformanceTracker::new($operation_name);
        let result = $code;
        tracker.trace_completion_with_result(&result);
        result
    }};
}
