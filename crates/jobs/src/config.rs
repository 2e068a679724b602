//! Job executor configuration.
//!
//! Values come from a JSON document (usually a section of the node config
//! file) and can be overridden by `STEPFLOW_*` environment variables. Every
//! field has a default, so an empty document is a valid configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use stepflow_core::{BackoffPolicy, EngineError};

use crate::acquisition::AcquisitionStrategyKind;
use crate::types::AcquisitionOrder;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::validation(err.to_string())
    }
}

/// Settings of the job executor of one engine node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobExecutorConfig {
    /// Jobs requested from a source per acquisition cycle.
    pub max_jobs_per_acquisition: usize,
    /// Lease length handed out by `try_lock`.
    pub lock_time_in_millis: u64,
    /// Idle wait after the first empty round (backoff seed).
    pub wait_time_in_millis: u64,
    pub max_wait_in_millis: u64,
    pub backoff_factor: u32,
    pub acquisition_strategy: AcquisitionStrategyKind,
    /// Order candidates by priority first; otherwise by due date only.
    pub acquire_by_priority: bool,
    /// Upper bound for the adaptive strategy's batch size.
    pub max_jobs_per_acquisition_cap: usize,
    /// Worker threads of the short-running pool.
    pub core_pool_size: usize,
    /// Batches that may wait for a worker before new ones are rejected.
    pub queue_capacity: usize,
    /// Retries a job starts with unless it says otherwise.
    pub default_retries: u32,
    /// Re-executions of a command after an optimistic locking conflict.
    pub command_retries: u32,
    /// Delay before a failed job becomes due again.
    pub retry_delay_in_millis: u64,
    /// Identity written into `lock_owner`. Generated when empty.
    pub lock_owner: String,
    /// Handler types that run on a dedicated thread per batch.
    pub long_running_handlers: Vec<String>,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_acquisition: 3,
            lock_time_in_millis: 300_000,
            wait_time_in_millis: 500,
            max_wait_in_millis: 60_000,
            backoff_factor: 2,
            acquisition_strategy: AcquisitionStrategyKind::Sequential,
            acquire_by_priority: true,
            max_jobs_per_acquisition_cap: 48,
            core_pool_size: 3,
            queue_capacity: 3,
            default_retries: 3,
            command_retries: 3,
            retry_delay_in_millis: 0,
            lock_owner: String::new(),
            long_running_handlers: Vec::new(),
        }
    }
}

impl JobExecutorConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `STEPFLOW_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (keyed by environment variable name).
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("STEPFLOW_MAX_JOBS_PER_ACQUISITION") {
            self.max_jobs_per_acquisition = parse_value("STEPFLOW_MAX_JOBS_PER_ACQUISITION", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_LOCK_TIME_IN_MILLIS") {
            self.lock_time_in_millis = parse_value("STEPFLOW_LOCK_TIME_IN_MILLIS", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_WAIT_TIME_IN_MILLIS") {
            self.wait_time_in_millis = parse_value("STEPFLOW_WAIT_TIME_IN_MILLIS", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_MAX_WAIT_IN_MILLIS") {
            self.max_wait_in_millis = parse_value("STEPFLOW_MAX_WAIT_IN_MILLIS", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_BACKOFF_FACTOR") {
            self.backoff_factor = parse_value("STEPFLOW_BACKOFF_FACTOR", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_ACQUISITION_STRATEGY") {
            self.acquisition_strategy = parse_value("STEPFLOW_ACQUISITION_STRATEGY", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_ACQUIRE_BY_PRIORITY") {
            self.acquire_by_priority = parse_value("STEPFLOW_ACQUIRE_BY_PRIORITY", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_CORE_POOL_SIZE") {
            self.core_pool_size = parse_value("STEPFLOW_CORE_POOL_SIZE", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_QUEUE_CAPACITY") {
            self.queue_capacity = parse_value("STEPFLOW_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_DEFAULT_RETRIES") {
            self.default_retries = parse_value("STEPFLOW_DEFAULT_RETRIES", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_COMMAND_RETRIES") {
            self.command_retries = parse_value("STEPFLOW_COMMAND_RETRIES", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_RETRY_DELAY_IN_MILLIS") {
            self.retry_delay_in_millis = parse_value("STEPFLOW_RETRY_DELAY_IN_MILLIS", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_LOCK_OWNER") {
            self.lock_owner = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_jobs_per_acquisition == 0 {
            return Err(ConfigError::Invalid(
                "max_jobs_per_acquisition must be at least 1".to_string(),
            ));
        }
        if self.max_jobs_per_acquisition_cap < self.max_jobs_per_acquisition {
            return Err(ConfigError::Invalid(
                "max_jobs_per_acquisition_cap must not be below max_jobs_per_acquisition"
                    .to_string(),
            ));
        }
        if self.lock_time_in_millis == 0 {
            return Err(ConfigError::Invalid("lock_time_in_millis must be positive".to_string()));
        }
        if self.core_pool_size == 0 {
            return Err(ConfigError::Invalid("core_pool_size must be at least 1".to_string()));
        }
        if self.backoff_factor == 0 {
            return Err(ConfigError::Invalid("backoff_factor must be at least 1".to_string()));
        }
        if self.max_wait_in_millis < self.wait_time_in_millis {
            return Err(ConfigError::Invalid(
                "max_wait_in_millis must not be below wait_time_in_millis".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_time(&self) -> Duration {
        Duration::from_millis(self.lock_time_in_millis)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_in_millis)
    }

    /// Idle backoff of the acquisition loop.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.wait_time_in_millis),
            self.backoff_factor,
            Duration::from_millis(self.max_wait_in_millis),
        )
    }

    pub fn acquisition_order(&self) -> AcquisitionOrder {
        if self.acquire_by_priority {
            AcquisitionOrder::Priority
        } else {
            AcquisitionOrder::DueDate
        }
    }

    /// The configured lock owner, or a fresh unique one.
    pub fn resolved_lock_owner(&self) -> String {
        if self.lock_owner.is_empty() {
            uuid::Uuid::now_v7().to_string()
        } else {
            self.lock_owner.clone()
        }
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, max: usize) -> Self {
        self.max_jobs_per_acquisition = max;
        self.max_jobs_per_acquisition_cap = self.max_jobs_per_acquisition_cap.max(max);
        self
    }

    pub fn with_strategy(mut self, strategy: AcquisitionStrategyKind) -> Self {
        self.acquisition_strategy = strategy;
        self
    }

    pub fn with_pool(mut self, core_pool_size: usize, queue_capacity: usize) -> Self {
        self.core_pool_size = core_pool_size;
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_long_running_handler(mut self, handler_type: impl Into<String>) -> Self {
        self.long_running_handlers.push(handler_type.into());
        self
    }
}

/// Parse one override value, reporting the key on failure.
pub fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = JobExecutorConfig::default();
        assert_eq!(config.max_jobs_per_acquisition, 3);
        assert_eq!(config.lock_time(), Duration::from_secs(300));
        assert_eq!(config.acquisition_strategy, AcquisitionStrategyKind::Sequential);
        assert_eq!(config.backoff_policy(), BackoffPolicy::default());
        assert_eq!(config.acquisition_order(), AcquisitionOrder::Priority);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_keeps_defaults_for_missing_fields() {
        let config = JobExecutorConfig::from_json_str(
            r#"{"max_jobs_per_acquisition": 10, "acquisition_strategy": "ADAPTIVE"}"#,
        )
        .unwrap();
        assert_eq!(config.max_jobs_per_acquisition, 10);
        assert_eq!(config.acquisition_strategy, AcquisitionStrategyKind::Adaptive);
        assert_eq!(config.default_retries, 3);
    }

    #[test]
    fn json_is_validated() {
        let err = JobExecutorConfig::from_json_str(r#"{"core_pool_size": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = JobExecutorConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn overrides_apply_and_reject_garbage() {
        let env: HashMap<&str, &str> = [
            ("STEPFLOW_MAX_JOBS_PER_ACQUISITION", "5"),
            ("STEPFLOW_ACQUISITION_STRATEGY", "sequential"),
            ("STEPFLOW_LOCK_OWNER", "node-1"),
        ]
        .into_iter()
        .collect();
        let config = JobExecutorConfig::default()
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_jobs_per_acquisition, 5);
        assert_eq!(config.resolved_lock_owner(), "node-1");

        let err = JobExecutorConfig::default()
            .with_overrides(|k| (k == "STEPFLOW_QUEUE_CAPACITY").then(|| "lots".to_string()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "STEPFLOW_QUEUE_CAPACITY".to_string(),
                value: "lots".to_string()
            }
        );
    }

    #[test]
    fn generated_lock_owners_are_unique() {
        let config = JobExecutorConfig::default();
        assert_ne!(config.resolved_lock_owner(), config.resolved_lock_owner());
    }
}
