//! Standalone autoscaler process
//!
//! Loads configuration from a file or from autoscaler.{toml,yaml} and the
//! environment, then scales every configured queue until SIGTERM or Ctrl-C.

use clap::Parser;
use queue_autoscaler::cli::{init_logging, start_from_config};
use queue_autoscaler::config::AutoscalerConfig;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "queue-autoscaler", version, about = "Scale job-queue worker pools from backlog and lag")]
struct Args {
    /// Configuration file (TOML or YAML)
    #[arg(short, long, env = "AUTOSCALER_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    let config = match &args.config {
        Some(path) => AutoscalerConfig::from_file(path)?,
        None => AutoscalerConfig::load()?,
    };

    start_from_config(config).await
}
