//! Configuration management for the autoscaler
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML or YAML configuration files
//! - Environment variables

use crate::broker::DEFAULT_COMPLETED_RETENTION;
use crate::{AutoscalerError, QueueConfig, QueueRegistry};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure for the autoscaler process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    /// Redis connection configuration
    pub redis: RedisConfig,

    /// Control loop timing
    pub control: ControlLoopConfig,

    /// Per-queue scaling policies
    pub queues: Vec<QueueConfig>,
}

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Connection pool size
    pub pool_size: Option<usize>,

    /// Length of the completed and failed history lists kept per queue
    pub completed_retention: usize,
}

/// Control loop timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlLoopConfig {
    /// Pause between two passes in milliseconds
    pub tick_interval_ms: u64,

    /// Upper bound for draining one worker before it is aborted
    pub worker_close_timeout_ms: u64,

    /// How long an idle worker blocks waiting for a job
    pub worker_poll_timeout_ms: u64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            control: ControlLoopConfig::default(),
            queues: vec![QueueConfig::default()],
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            pool_size: None,
            completed_retention: DEFAULT_COMPLETED_RETENTION,
        }
    }
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10_000,
            worker_close_timeout_ms: 30_000,
            worker_poll_timeout_ms: 5_000,
        }
    }
}

impl ControlLoopConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn worker_close_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_close_timeout_ms)
    }

    pub fn worker_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_poll_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, AutoscalerError> {
    raw.trim()
        .parse()
        .map_err(|_| AutoscalerError::Configuration(format!("Invalid {}: '{}'", name, raw)))
}

/// Parse a comma-separated list of compact queue specs.
pub fn parse_queue_list(raw: &str) -> Result<Vec<QueueConfig>, AutoscalerError> {
    raw.split(',')
        .map(str::trim)
        .filter(|spec| !spec.is_empty())
        .map(str::parse)
        .collect()
}

/// A worker blocked in a fetch must be able to return before its close
/// timeout aborts it, or the fetched job is stranded in the active set.
pub fn ensure_close_outlasts_poll(close: Duration, poll: Duration) -> Result<(), AutoscalerError> {
    if close <= poll {
        return Err(AutoscalerError::ConfigInvalid(format!(
            "Worker close timeout ({}ms) must exceed the worker poll timeout ({}ms)",
            close.as_millis(),
            poll.as_millis()
        )));
    }
    Ok(())
}

impl AutoscalerConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), AutoscalerError> {
        // Validate Redis URL
        if self.redis.url.is_empty() {
            return Err(AutoscalerError::ConfigInvalid(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
            return Err(AutoscalerError::ConfigInvalid(
                "Redis URL must start with redis:// or rediss://".to_string(),
            ));
        }

        if let Some(pool_size) = self.redis.pool_size {
            if pool_size == 0 || pool_size > 1000 {
                return Err(AutoscalerError::ConfigInvalid(
                    "Redis pool size must be between 1 and 1000".to_string(),
                ));
            }
        }

        if self.redis.completed_retention < crate::collector::DURATION_SAMPLE_SIZE {
            return Err(AutoscalerError::ConfigInvalid(format!(
                "Completed retention must be at least {}",
                crate::collector::DURATION_SAMPLE_SIZE
            )));
        }

        // Validate control loop timing
        if self.control.tick_interval_ms < 100 || self.control.tick_interval_ms > 3_600_000 {
            return Err(AutoscalerError::ConfigInvalid(
                "Tick interval must be between 100ms and 1 hour".to_string(),
            ));
        }

        if self.control.worker_close_timeout_ms == 0
            || self.control.worker_close_timeout_ms > 3_600_000
        {
            return Err(AutoscalerError::ConfigInvalid(
                "Worker close timeout must be between 1ms and 1 hour".to_string(),
            ));
        }

        if self.control.worker_poll_timeout_ms == 0 || self.control.worker_poll_timeout_ms > 60_000 {
            return Err(AutoscalerError::ConfigInvalid(
                "Worker poll timeout must be between 1ms and 60 seconds".to_string(),
            ));
        }

        ensure_close_outlasts_poll(
            self.control.worker_close_timeout(),
            self.control.worker_poll_timeout(),
        )?;

        // Validate queues
        self.registry().map(|_| ())
    }

    /// The validated queue set.
    pub fn registry(&self) -> Result<QueueRegistry, AutoscalerError> {
        QueueRegistry::new(self.queues.clone())
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self, AutoscalerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by the variables `lookup` resolves.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AutoscalerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<(), AutoscalerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REDIS_URL") {
            self.redis.url = url;
        }

        if let Some(pool_size) = lookup("REDIS_POOL_SIZE") {
            self.redis.pool_size = Some(parse_var("REDIS_POOL_SIZE", &pool_size)?);
        }

        if let Some(tick) = lookup("AUTOSCALER_TICK_INTERVAL_MS") {
            self.control.tick_interval_ms = parse_var("AUTOSCALER_TICK_INTERVAL_MS", &tick)?;
        }

        if let Some(timeout) = lookup("AUTOSCALER_CLOSE_TIMEOUT_MS") {
            self.control.worker_close_timeout_ms = parse_var("AUTOSCALER_CLOSE_TIMEOUT_MS", &timeout)?;
        }

        if let Some(timeout) = lookup("AUTOSCALER_POLL_TIMEOUT_MS") {
            self.control.worker_poll_timeout_ms = parse_var("AUTOSCALER_POLL_TIMEOUT_MS", &timeout)?;
        }

        if let Some(queues) = lookup("AUTOSCALER_QUEUES") {
            self.queues = parse_queue_list(&queues)?;
        }

        Ok(())
    }

    /// Load configuration from a file (TOML or YAML based on extension)
    #[cfg(feature = "config")]
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, AutoscalerError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AutoscalerError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: AutoscalerConfig = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&contents).map_err(|e| {
                AutoscalerError::Configuration(format!("Failed to parse TOML config: {}", e))
            })?
        } else {
            serde_yaml::from_str(&contents).map_err(|e| {
                AutoscalerError::Configuration(format!("Failed to parse YAML config: {}", e))
            })?
        };

        config.validate()?;

        Ok(config)
    }

    /// Load configuration with automatic source detection and validation.
    ///
    /// Precedence, lowest first: defaults, the first of `autoscaler.{toml,yaml,yml}`
    /// or `config/autoscaler.{toml,yaml,yml}`, `AUTOSCALER__SECTION__KEY`
    /// variables, then the flat variables read by [`from_env`](Self::from_env).
    #[cfg(feature = "config")]
    pub fn load() -> Result<Self, AutoscalerError> {
        use config::{Config, Environment, File};

        // Queues are left out of the defaults so a file's list replaces them
        // instead of being merged index by index.
        let defaults = Self {
            queues: Vec::new(),
            ..Self::default()
        };

        let mut builder = Config::builder().add_source(Config::try_from(&defaults).map_err(|e| {
            AutoscalerError::Configuration(format!("Failed to create default config: {}", e))
        })?);

        for config_path in &[
            "autoscaler.toml",
            "autoscaler.yaml",
            "autoscaler.yml",
            "config/autoscaler.toml",
            "config/autoscaler.yaml",
            "config/autoscaler.yml",
        ] {
            if std::path::Path::new(config_path).exists() {
                builder = builder.add_source(File::with_name(config_path));
                break;
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("AUTOSCALER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().map_err(|e| {
            AutoscalerError::Configuration(format!("Failed to build config: {}", e))
        })?;

        let mut config: AutoscalerConfig = config.try_deserialize().map_err(|e| {
            AutoscalerError::Configuration(format!("Failed to deserialize config: {}", e))
        })?;

        config.apply_env(|name| std::env::var(name).ok())?;

        if config.queues.is_empty() {
            config.queues.push(QueueConfig::default());
        }

        config.validate()?;

        Ok(config)
    }

    /// Load configuration without the config crate (fallback)
    #[cfg(not(feature = "config"))]
    pub fn load() -> Result<Self, AutoscalerError> {
        Self::from_env()
    }
}

/// Configuration builder for fluent API
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: AutoscalerConfig,
    queues: Vec<QueueConfig>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.config.redis.url = url.into();
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.redis.pool_size = Some(size);
        self
    }

    pub fn completed_retention(mut self, retention: usize) -> Self {
        self.config.redis.completed_retention = retention;
        self
    }

    pub fn tick_interval_ms(mut self, ms: u64) -> Self {
        self.config.control.tick_interval_ms = ms;
        self
    }

    pub fn worker_close_timeout_ms(mut self, ms: u64) -> Self {
        self.config.control.worker_close_timeout_ms = ms;
        self
    }

    pub fn worker_poll_timeout_ms(mut self, ms: u64) -> Self {
        self.config.control.worker_poll_timeout_ms = ms;
        self
    }

    /// Add a queue. The first call replaces the default queue.
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn build(mut self) -> AutoscalerConfig {
        if !self.queues.is_empty() {
            self.config.queues = self.queues;
        }
        self.config
    }
}
