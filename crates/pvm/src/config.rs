//! Runtime configuration.

use serde::{Deserialize, Serialize};

use stepflow_jobs::ConfigError;
use stepflow_jobs::config::parse_value;

/// Settings of the process runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Atomic operations one command may perform before the rest of the work
    /// is handed to async-continuation jobs.
    pub step_budget: usize,
    /// Priority of async-continuation jobs.
    pub continuation_priority: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            step_budget: 1_000,
            continuation_priority: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("STEPFLOW_STEP_BUDGET") {
            self.step_budget = parse_value("STEPFLOW_STEP_BUDGET", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_CONTINUATION_PRIORITY") {
            self.continuation_priority = parse_value("STEPFLOW_CONTINUATION_PRIORITY", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.step_budget == 0 {
            return Err(ConfigError::Invalid("step_budget must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn with_step_budget(mut self, step_budget: usize) -> Self {
        self.step_budget = step_budget;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = RuntimeConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.step_budget, 1_000);
    }

    #[test]
    fn overrides_are_validated() {
        let config = RuntimeConfig::default()
            .with_overrides(|key| (key == "STEPFLOW_STEP_BUDGET").then(|| "25".to_string()))
            .unwrap();
        assert_eq!(config.step_budget, 25);

        let err = RuntimeConfig::default()
            .with_overrides(|key| (key == "STEPFLOW_STEP_BUDGET").then(|| "0".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = RuntimeConfig::default()
            .with_overrides(|key| (key == "STEPFLOW_STEP_BUDGET").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
