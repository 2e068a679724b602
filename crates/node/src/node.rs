//! Wiring of one engine node.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use stepflow_core::{Clock, SystemClock};
use stepflow_jobs::{
    AcquisitionHandle, AcquisitionLoop, CallerRuns, DeploymentRegistry, ExternalTaskService,
    InMemoryJobStore, JobService, JobStore, WorkerDispatcher,
};
use stepflow_pvm::{InMemoryProcessStore, RuntimeService};

use crate::config::NodeConfig;

/// A running node: runtime, job acquisition and worker pool.
pub struct Node {
    pub runtime: Arc<RuntimeService>,
    pub jobs: Arc<JobService>,
    pub external_tasks: Arc<ExternalTaskService>,
    dispatcher: Arc<WorkerDispatcher>,
    acquisition: AcquisitionHandle,
}

impl Node {
    pub async fn start(config: &NodeConfig) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let job_store = job_store(config).await?;
        let jobs = Arc::new(JobService::new("default", job_store, clock.clone(), &config.jobs));
        let external_tasks = Arc::new(ExternalTaskService::new(clock));
        let deployments = Arc::new(DeploymentRegistry::new());

        let runtime = RuntimeService::new(
            InMemoryProcessStore::arc(),
            jobs.clone(),
            external_tasks.clone(),
            deployments.clone(),
            config.runtime.clone(),
        );

        let dispatcher = Arc::new(
            WorkerDispatcher::new(
                "job-executor",
                config.jobs.core_pool_size,
                config.jobs.queue_capacity,
                deployments,
                Arc::new(CallerRuns),
            )
            .context("failed to start worker pool")?,
        );
        let acquisition = AcquisitionLoop::new(&config.jobs, vec![jobs.clone()], dispatcher.clone())
            .context("invalid job executor configuration")?
            .spawn()
            .context("failed to start job acquisition")?;
        info!(
            lock_owner = %acquisition.stats().lock_owner,
            pool_size = config.jobs.core_pool_size,
            "engine node started"
        );

        Ok(Self {
            runtime,
            jobs,
            external_tasks,
            dispatcher,
            acquisition,
        })
    }

    /// Stop acquiring, then drain and join the worker pool.
    pub fn shutdown(self) {
        let stats = self.acquisition.stats();
        self.acquisition.shutdown();
        self.dispatcher.shutdown();
        info!(
            cycles = stats.cycles,
            jobs_acquired = stats.jobs_acquired,
            executor = ?self.jobs.executor().stats(),
            "engine node stopped"
        );
    }
}

#[cfg(feature = "postgres")]
async fn job_store(config: &NodeConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    let Some(url) = &config.database_url else {
        return Ok(InMemoryJobStore::arc());
    };
    let pool = sqlx::PgPool::connect(url)
        .await
        .context("failed to connect to the job database")?;
    let store = stepflow_jobs::PostgresJobStore::new(pool, tokio::runtime::Handle::current());
    store.ensure_schema().await?;
    info!("using postgres job store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn job_store(config: &NodeConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    if config.database_url.is_some() {
        anyhow::bail!("database_url is set but the node was built without the postgres feature");
    }
    Ok(InMemoryJobStore::arc())
}
