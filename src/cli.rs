//! Process entry helpers
//!
//! Utilities for running the autoscaler as a standalone process with
//! minimal boilerplate: logging setup, signal handling and a reference
//! job handler.

use crate::config::AutoscalerConfig;
use crate::prelude::*;
use std::error::Error;

/// Initialize the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_logging(level: &str, json: bool) -> Result<(), Box<dyn Error + Send + Sync>> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        fmt().with_env_filter(filter).with_target(true).try_init()
    }
}

/// Reference handler that logs every job and acknowledges it.
///
/// Deployments register their own handlers; this one keeps the standalone
/// binary useful for smoke tests and queue draining.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingJobHandler;

#[async_trait]
impl JobHandler for LoggingJobHandler {
    async fn handle(&self, job: &Job) -> JobResult {
        tracing::info!(
            job_id = %job.id,
            queue = %job.queue,
            job_name = %job.name,
            payload_bytes = job.payload.len(),
            "Processed job"
        );
        Ok(())
    }
}

/// Resolve when the process receives Ctrl-C or, on Unix, SIGTERM.
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Build and start the autoscaler, then stop it on the first termination
/// signal.
///
/// # Example
///
/// ```rust,no_run
/// use queue_autoscaler::cli::run_until_signal;
/// use queue_autoscaler::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
///     let config = AutoscalerConfig::load()?;
///     let builder = AutoscalerBuilder::new(config)
///         .handler("emails", handler_fn(|job: Job| async move {
///             println!("sending {}", job.id);
///             Ok(())
///         }));
///     run_until_signal(builder).await
/// }
/// ```
pub async fn run_until_signal(builder: AutoscalerBuilder) -> Result<(), Box<dyn Error + Send + Sync>> {
    let autoscaler = builder.build().await?;

    tracing::info!(
        queues = ?autoscaler.registry().names(),
        tick_interval_ms = autoscaler.tick_interval().as_millis() as u64,
        "Starting autoscaler"
    );

    let mut handle = autoscaler.start();

    tokio::select! {
        signal = wait_for_signal() => {
            signal?;
            tracing::info!("Shutting down gracefully...");
            handle.stop().await?;
        }
        _ = handle.wait_for(AutoscalerState::Stopped) => {
            // Initialization failed; surface the error from the task.
            handle.join().await?;
        }
    }

    Ok(())
}

/// Run the autoscaler from `config` with a [`LoggingJobHandler`] on every
/// queue.
pub async fn start_from_config(config: AutoscalerConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing::info!("Redis URL: {}", config.redis.url);

    let mut builder = AutoscalerBuilder::new(config.clone());
    for queue in &config.queues {
        builder = builder.handler(queue.name.clone(), LoggingJobHandler);
    }

    run_until_signal(builder).await
}

/// Load configuration from files and environment, then run.
pub async fn start_autoscaler() -> Result<(), Box<dyn Error + Send + Sync>> {
    start_from_config(AutoscalerConfig::load()?).await
}

/// Load configuration from environment variables only, then run.
pub async fn start_autoscaler_from_env() -> Result<(), Box<dyn Error + Send + Sync>> {
    start_from_config(AutoscalerConfig::from_env()?).await
}

/// Macro to create a complete autoscaler binary with minimal code
///
/// # Example
///
/// ```rust,no_run
/// queue_autoscaler::create_autoscaler_main!();
/// ```
#[macro_export]
macro_rules! create_autoscaler_main {
    () => {
        #[tokio::main]
        async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            $crate::cli::init_logging("info", false)?;
            $crate::cli::start_autoscaler().await
        }
    };

    (env) => {
        #[tokio::main]
        async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            $crate::cli::init_logging("info", false)?;
            $crate::cli::start_autoscaler_from_env().await
        }
    };
}
