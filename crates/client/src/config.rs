//! Polling client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use stepflow_core::BackoffPolicy;
use stepflow_jobs::ConfigError;
use stepflow_jobs::config::parse_value;

/// Settings of one external task client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Worker id reported with every request; empty means a generated one.
    pub worker_id: String,
    /// Tasks requested per fetch.
    pub max_tasks: usize,
    /// Lease taken on fetched tasks unless a subscription sets its own.
    pub lock_duration_in_millis: u64,
    /// Long-poll timeout of a fetch; `None` returns immediately.
    pub async_response_timeout_in_millis: Option<u64>,
    pub use_priority: bool,
    /// Wait after the first empty fetch.
    pub starting_wait_in_millis: u64,
    pub backoff_factor: u32,
    pub max_wait_in_millis: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            max_tasks: 10,
            lock_duration_in_millis: 20_000,
            async_response_timeout_in_millis: None,
            use_priority: true,
            starting_wait_in_millis: 500,
            backoff_factor: 2,
            max_wait_in_millis: 60_000,
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `STEPFLOW_CLIENT_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("STEPFLOW_CLIENT_WORKER_ID") {
            self.worker_id = v;
        }
        if let Some(v) = lookup("STEPFLOW_CLIENT_MAX_TASKS") {
            self.max_tasks = parse_value("STEPFLOW_CLIENT_MAX_TASKS", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_CLIENT_LOCK_DURATION_IN_MILLIS") {
            self.lock_duration_in_millis =
                parse_value("STEPFLOW_CLIENT_LOCK_DURATION_IN_MILLIS", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_CLIENT_ASYNC_RESPONSE_TIMEOUT_IN_MILLIS") {
            self.async_response_timeout_in_millis =
                Some(parse_value("STEPFLOW_CLIENT_ASYNC_RESPONSE_TIMEOUT_IN_MILLIS", &v)?);
        }
        if let Some(v) = lookup("STEPFLOW_CLIENT_STARTING_WAIT_IN_MILLIS") {
            self.starting_wait_in_millis =
                parse_value("STEPFLOW_CLIENT_STARTING_WAIT_IN_MILLIS", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_CLIENT_BACKOFF_FACTOR") {
            self.backoff_factor = parse_value("STEPFLOW_CLIENT_BACKOFF_FACTOR", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_CLIENT_MAX_WAIT_IN_MILLIS") {
            self.max_wait_in_millis = parse_value("STEPFLOW_CLIENT_MAX_WAIT_IN_MILLIS", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tasks == 0 {
            return Err(ConfigError::Invalid("max_tasks must be at least 1".to_string()));
        }
        if self.lock_duration_in_millis == 0 {
            return Err(ConfigError::Invalid(
                "lock_duration_in_millis must be positive".to_string(),
            ));
        }
        if self.backoff_factor == 0 {
            return Err(ConfigError::Invalid("backoff_factor must be at least 1".to_string()));
        }
        if self.max_wait_in_millis < self.starting_wait_in_millis {
            return Err(ConfigError::Invalid(
                "max_wait_in_millis must not be below starting_wait_in_millis".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_in_millis)
    }

    pub fn async_response_timeout(&self) -> Option<Duration> {
        self.async_response_timeout_in_millis.map(Duration::from_millis)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.starting_wait_in_millis),
            self.backoff_factor,
            Duration::from_millis(self.max_wait_in_millis),
        )
    }

    pub fn resolved_worker_id(&self) -> String {
        if self.worker_id.is_empty() {
            format!("worker-{}", uuid::Uuid::now_v7())
        } else {
            self.worker_id.clone()
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }
}
