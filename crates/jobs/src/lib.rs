//! Asynchronous job scheduler: durable lockable jobs, acquisition, dispatch
//! and retries.
//!
//! ## Design
//!
//! - Jobs are leased by a (`lock_owner`, `lock_expiration_time`) pair set
//!   through a conditional update; losing a race is a `false`, never an error
//! - Acquisition loops query one job source per cycle as chosen by a strategy
//!   and back off when nothing is due
//! - Locked jobs are grouped per process instance and handed to a bounded worker
//!   pool inside their deployment context
//! - Every unit of work runs inside a command envelope that retries optimistic
//!   locking conflicts and turns failures into retry decrements and incidents
//!
//! ## Components
//!
//! - `JobStore`: persistence for jobs and incidents (in-memory or Postgres)
//! - `JobService`: job submission and operator API for one job source
//! - `AcquisitionLoop`: the background acquisition thread
//! - `WorkerDispatcher`: bounded pool plus dedicated long-running threads
//! - `JobExecutor`: runs one job with retry/incident handling
//! - `ExternalTaskService`: fetch-and-lock API for remote polling workers

pub mod acquisition;
pub mod command;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod executor;
pub mod external_task;
pub mod handler;
pub mod service;
pub mod store;
pub mod types;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;

#[cfg(test)]
mod integration_tests;

pub use acquisition::{
    AcquisitionHandle, AcquisitionLoop, AcquisitionStats, AcquisitionStrategy,
    AcquisitionStrategyKind, AdaptiveStrategy, CycleOutcome, CyclePlan, CycleReport,
    SequentialStrategy,
};
pub use command::CommandExecutor;
pub use config::{ConfigError, JobExecutorConfig};
pub use context::{AlwaysAvailable, DeploymentContextProvider, DeploymentRegistry};
pub use dispatcher::{
    Batch, BatchRunner, CallerRuns, DispatchOutcome, ReleaseLocks, RejectedBatchHandler,
    WorkerDispatcher,
};
pub use executor::{ExecutorStats, JobExecutor, JobOutcome};
pub use external_task::{
    ExternalTask, ExternalTaskCompletion, ExternalTaskService, FetchRequest, LockedExternalTask,
    NewExternalTask, TopicRequest,
};
pub use handler::{DispatchClass, FnHandler, HandlerRegistry, JobContext, JobHandler};
pub use service::{JobService, LoopSignal};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    AcquirableJob, AcquisitionOrder, FAILED_EXTERNAL_TASK_INCIDENT, FAILED_JOB_INCIDENT, Incident, Job,
    JobFilter, NewJob,
};
