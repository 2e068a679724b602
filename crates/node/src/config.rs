//! Node configuration: one JSON document with a section per component.
//!
//! The file named by `STEPFLOW_CONFIG` is read when set; every section then
//! takes its own `STEPFLOW_*` environment overrides.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use stepflow_client::ClientConfig;
use stepflow_jobs::JobExecutorConfig;
use stepflow_observability::LogConfig;
use stepflow_pvm::RuntimeConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub log: LogConfig,
    pub jobs: JobExecutorConfig,
    pub runtime: RuntimeConfig,
    pub client: ClientConfig,
    /// Postgres job store; the in-memory store is used when unset.
    pub database_url: Option<String>,
    pub demo: DemoConfig,
}

/// Sample workload started by the node.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub instances: usize,
    /// Stop after this long; `None` runs until interrupted.
    pub run_for_in_millis: Option<u64>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            instances: 5,
            run_for_in_millis: None,
        }
    }
}

impl NodeConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("invalid node configuration")?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json_str(&json)
    }

    /// Load from `STEPFLOW_CONFIG` (or defaults) and apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let config = match std::env::var("STEPFLOW_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.jobs = self.jobs.with_overrides(&lookup)?;
        self.runtime = self.runtime.with_overrides(&lookup)?;
        self.client = self.client.with_overrides(&lookup)?;
        if let Some(url) = lookup("STEPFLOW_DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(v) = lookup("STEPFLOW_DEMO_INSTANCES") {
            self.demo.instances = stepflow_jobs::config::parse_value("STEPFLOW_DEMO_INSTANCES", &v)?;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_default_independently() {
        let config = NodeConfig::from_json_str(
            r#"{ "jobs": { "max_jobs_per_acquisition": 6 }, "runtime": { "step_budget": 50 } }"#,
        )
        .unwrap();
        assert_eq!(config.jobs.max_jobs_per_acquisition, 6);
        assert_eq!(config.jobs.lock_time_in_millis, 300_000);
        assert_eq!(config.runtime.step_budget, 50);
        assert_eq!(config.client.max_tasks, 10);
        assert_eq!(config.demo.instances, 5);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn overrides_reach_every_section() {
        let config = NodeConfig::default()
            .with_overrides(|key| match key {
                "STEPFLOW_CORE_POOL_SIZE" => Some("8".to_string()),
                "STEPFLOW_STEP_BUDGET" => Some("200".to_string()),
                "STEPFLOW_CLIENT_MAX_TASKS" => Some("2".to_string()),
                "STEPFLOW_DEMO_INSTANCES" => Some("0".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.jobs.core_pool_size, 8);
        assert_eq!(config.runtime.step_budget, 200);
        assert_eq!(config.client.max_tasks, 2);
        assert_eq!(config.demo.instances, 0);

        assert!(
            NodeConfig::default()
                .with_overrides(|key| (key == "STEPFLOW_STEP_BUDGET").then(|| "0".to_string()))
                .is_err()
        );
    }
}
