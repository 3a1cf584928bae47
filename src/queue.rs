use crate::AutoscalerError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

/// Hard ceiling on `max_workers` for a single queue.
pub const MAX_WORKERS_PER_QUEUE: usize = 1000;

/// Static scaling policy for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Backlog age above which scale-up is urgent.
    pub lag_threshold_ms: u64,
    /// Desired steady-state jobs handled per worker.
    pub target_jobs_per_worker: u64,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn workers(mut self, min_workers: usize, max_workers: usize) -> Self {
        self.min_workers = min_workers;
        self.max_workers = max_workers;
        self
    }

    #[must_use]
    pub fn lag_threshold_ms(mut self, lag_threshold_ms: u64) -> Self {
        self.lag_threshold_ms = lag_threshold_ms;
        self
    }

    #[must_use]
    pub fn target_jobs_per_worker(mut self, target: u64) -> Self {
        self.target_jobs_per_worker = target;
        self
    }

    /// Validate queue policy
    pub fn validate(&self) -> Result<(), AutoscalerError> {
        if self.name.trim().is_empty() {
            return Err(AutoscalerError::ConfigInvalid(
                "Queue name cannot be empty".to_string(),
            ));
        }

        if self.min_workers == 0 {
            return Err(AutoscalerError::ConfigInvalid(format!(
                "Queue '{}': minimum workers must be greater than 0",
                self.name
            )));
        }

        if self.max_workers < self.min_workers {
            return Err(AutoscalerError::ConfigInvalid(format!(
                "Queue '{}': maximum workers ({}) must be greater than or equal to minimum workers ({})",
                self.name, self.max_workers, self.min_workers
            )));
        }

        if self.max_workers > MAX_WORKERS_PER_QUEUE {
            return Err(AutoscalerError::ConfigInvalid(format!(
                "Queue '{}': maximum workers cannot exceed {}",
                self.name, MAX_WORKERS_PER_QUEUE
            )));
        }

        if self.target_jobs_per_worker == 0 {
            return Err(AutoscalerError::ConfigInvalid(format!(
                "Queue '{}': target jobs per worker must be greater than 0",
                self.name
            )));
        }

        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            min_workers: 1,
            max_workers: 5,
            lag_threshold_ms: 30_000,
            target_jobs_per_worker: 10,
        }
    }
}

/// Parses the compact `name:min:max:lag_ms:target` form used in environment
/// variables. Trailing fields may be omitted and fall back to defaults.
impl FromStr for QueueConfig {
    type Err = AutoscalerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(AutoscalerError::Configuration(format!(
                "Invalid queue spec '{}': missing name",
                s
            )));
        }

        let mut config = QueueConfig::new(name);

        fn field<T: FromStr>(spec: &str, label: &str, raw: Option<&str>, slot: &mut T) -> Result<(), AutoscalerError> {
            if let Some(raw) = raw {
                *slot = raw.trim().parse().map_err(|_| {
                    AutoscalerError::Configuration(format!(
                        "Invalid queue spec '{}': bad {} '{}'",
                        spec, label, raw
                    ))
                })?;
            }
            Ok(())
        }

        field(s, "min_workers", parts.next(), &mut config.min_workers)?;
        field(s, "max_workers", parts.next(), &mut config.max_workers)?;
        field(s, "lag_threshold_ms", parts.next(), &mut config.lag_threshold_ms)?;
        field(s, "target_jobs_per_worker", parts.next(), &mut config.target_jobs_per_worker)?;

        if parts.next().is_some() {
            return Err(AutoscalerError::Configuration(format!(
                "Invalid queue spec '{}': too many fields",
                s
            )));
        }

        Ok(config)
    }
}

/// The fixed set of queues managed by one autoscaler, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct QueueRegistry {
    queues: Vec<QueueConfig>,
}

impl QueueRegistry {
    pub fn new(queues: Vec<QueueConfig>) -> Result<Self, AutoscalerError> {
        let registry = Self { queues };
        registry.validate()?;
        Ok(registry)
    }

    /// Every queue must be valid and names must be unique.
    pub fn validate(&self) -> Result<(), AutoscalerError> {
        if self.queues.is_empty() {
            return Err(AutoscalerError::ConfigInvalid(
                "At least one queue must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            queue.validate()?;
            if !seen.insert(queue.name.as_str()) {
                return Err(AutoscalerError::ConfigInvalid(format!(
                    "Queue '{}' is configured more than once",
                    queue.name
                )));
            }
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueConfig> {
        self.queues.iter()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_default_is_valid() {
        assert!(QueueConfig::default().validate().is_ok());
    }

    #[test]
    fn test_min_greater_than_max_is_rejected() {
        let config = QueueConfig::new("emails").workers(4, 2);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, AutoscalerError::ConfigInvalid(_)));
        assert!(err.to_string().contains("must be greater than or equal to minimum"));
    }

    #[test]
    fn test_zero_min_and_zero_target_are_rejected() {
        assert!(QueueConfig::new("a").workers(0, 2).validate().is_err());
        assert!(QueueConfig::new("a").target_jobs_per_worker(0).validate().is_err());
        assert!(QueueConfig::new("a").workers(1, 1001).validate().is_err());
    }

    #[test]
    fn test_parse_compact_spec() {
        let config: QueueConfig = "search-index:2:8:60000:25".parse().unwrap();
        assert_eq!(config.name, "search-index");
        assert_eq!(config.min_workers, 2);
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.lag_threshold_ms, 60_000);
        assert_eq!(config.target_jobs_per_worker, 25);
    }

    #[test]
    fn test_parse_partial_spec_uses_defaults() {
        let config: QueueConfig = "emails:2:3".parse().unwrap();
        assert_eq!(config.min_workers, 2);
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.lag_threshold_ms, 30_000);
        assert_eq!(config.target_jobs_per_worker, 10);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<QueueConfig>().is_err());
        assert!("emails:two".parse::<QueueConfig>().is_err());
        assert!("emails:1:2:3:4:5".parse::<QueueConfig>().is_err());
    }

    #[test]
    fn test_registry_rejects_duplicates_and_empty() {
        assert!(QueueRegistry::new(vec![]).is_err());

        let result = QueueRegistry::new(vec![QueueConfig::new("a"), QueueConfig::new("a")]);
        assert!(result.unwrap_err().to_string().contains("more than once"));
    }

    #[test]
    fn test_registry_preserves_order() {
        let registry = QueueRegistry::new(vec![
            QueueConfig::new("high"),
            QueueConfig::new("default"),
            QueueConfig::new("low"),
        ])
        .unwrap();

        assert_eq!(registry.names(), vec!["high", "default", "low"]);
        assert_eq!(registry.get("low").map(|q| q.name.as_str()), Some("low"));
        assert!(registry.get("missing").is_none());
    }
}
