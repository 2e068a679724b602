//! Job service: submission and operator API of one job source.

use std::sync::{mpsc, Arc, Mutex};

use tracing::{debug, info};

use stepflow_core::{Clock, EngineError, EngineResult, JobId, ProcessInstanceId};

use crate::acquisition::LoopMessage;
use crate::command::CommandExecutor;
use crate::config::JobExecutorConfig;
use crate::executor::{JobExecutor, JobOutcome};
use crate::handler::{DispatchClass, HandlerRegistry, JobHandler};
use crate::store::JobStore;
use crate::types::{Incident, Job, JobFilter, NewJob};

/// Wakes the acquisition loops serving a job source.
#[derive(Debug, Default, Clone)]
pub struct LoopSignal {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<LoopMessage>>>>,
}

impl LoopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self, tx: mpsc::Sender<LoopMessage>) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subscribers.push(tx);
    }

    /// Interrupt the idle wait of every subscribed loop. Stopped loops are dropped.
    pub fn notify(&self) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subscribers.retain(|tx| tx.send(LoopMessage::Wake).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// One job source: a job store, the handlers that run its jobs and the signal
/// that wakes the loops acquiring from it.
pub struct JobService {
    name: String,
    store: Arc<dyn JobStore>,
    executor: Arc<JobExecutor>,
    clock: Arc<dyn Clock>,
    signal: LoopSignal,
    default_retries: u32,
}

impl JobService {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: &JobExecutorConfig,
    ) -> Self {
        let handlers = Arc::new(HandlerRegistry::with_long_running(
            config.long_running_handlers.iter().cloned(),
        ));
        let executor = JobExecutor::new(
            store.clone(),
            handlers,
            clock.clone(),
            CommandExecutor::new(config.command_retries),
        )
        .with_retry_delay(config.retry_delay());

        Self {
            name: name.into(),
            store,
            executor: Arc::new(executor),
            clock,
            signal: LoopSignal::new(),
            default_retries: config.default_retries,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn executor(&self) -> &Arc<JobExecutor> {
        &self.executor
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn signal(&self) -> &LoopSignal {
        &self.signal
    }

    pub fn register_handler(&self, handler: Arc<dyn JobHandler>) {
        self.executor.handlers().register(handler);
    }

    pub fn dispatch_class(&self, handler_type: &str) -> DispatchClass {
        self.executor.handlers().dispatch_class(handler_type)
    }

    /// Persist a new job. A job that is due right away wakes the acquisition loops.
    pub fn create_job(&self, job: NewJob) -> EngineResult<JobId> {
        let now = self.clock.now();
        let job = job.into_job(JobId::new(), self.default_retries, now);
        let due_now = job.is_due_at(now);
        let stored = self.store.insert(job)?;
        debug!(
            source = %self.name,
            job_id = %stored.id,
            handler_type = %stored.handler_type,
            priority = stored.priority,
            "job created"
        );
        if due_now {
            self.signal.notify();
        }
        Ok(stored.id)
    }

    pub fn cancel_job(&self, id: JobId) -> EngineResult<()> {
        match self.store.delete(id)? {
            Some(_) => {
                debug!(source = %self.name, job_id = %id, "job cancelled");
                Ok(())
            }
            None => Err(EngineError::not_found(format!("job {id}"))),
        }
    }

    /// Set the remaining retries. Raising them on a failed job resolves its
    /// incident and releases its lease; lowering them to 0 raises one.
    pub fn set_job_retries(&self, id: JobId, retries: u32) -> EngineResult<()> {
        let revived = self.executor.command().execute("set-job-retries", || {
            let now = self.clock.now();
            let mut job = self.require(id)?;
            let was_failed = job.is_failed();
            job.retries = retries;
            if was_failed && retries > 0 {
                job.reset_lock();
            }
            let updated = self.store.update(&job)?;

            if was_failed && retries > 0 {
                self.store.resolve_incidents(id)?;
            } else if !was_failed && retries == 0 {
                self.store.insert_incident(Incident::failed_job(
                    &updated,
                    "retries set to 0",
                    now,
                ))?;
            }
            Ok(was_failed && retries > 0 && updated.is_due_at(now))
        })?;
        if revived {
            info!(source = %self.name, job_id = %id, retries, "failed job revived");
            self.signal.notify();
        }
        Ok(())
    }

    pub fn set_job_priority(&self, id: JobId, priority: i64) -> EngineResult<()> {
        self.modify("set-job-priority", id, |job| job.priority = priority)
    }

    /// Suspended jobs are skipped by acquisition until activated again.
    pub fn suspend_job(&self, id: JobId) -> EngineResult<()> {
        self.modify("suspend-job", id, |job| job.suspended = true)
    }

    pub fn activate_job(&self, id: JobId) -> EngineResult<()> {
        self.modify("activate-job", id, |job| job.suspended = false)?;
        self.signal.notify();
        Ok(())
    }

    /// Run a job on the calling thread, ignoring its due date and lease.
    /// Failures are recorded against the job and returned.
    pub fn execute_job(&self, id: JobId) -> EngineResult<()> {
        match self.executor.execute(id, None) {
            JobOutcome::Succeeded => Ok(()),
            JobOutcome::Skipped => Err(EngineError::not_found(format!("job {id}"))),
            JobOutcome::Failed { error, .. }
            | JobOutcome::Incident { error }
            | JobOutcome::Abandoned { error }
            | JobOutcome::Conflict { error } => Err(error),
        }
    }

    pub fn find_job(&self, id: JobId) -> EngineResult<Option<Job>> {
        Ok(self.store.find_by_id(id)?)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> EngineResult<Vec<Job>> {
        Ok(self.store.list(filter)?)
    }

    pub fn incidents(
        &self,
        process_instance_id: Option<ProcessInstanceId>,
    ) -> EngineResult<Vec<Incident>> {
        Ok(self.store.list_incidents(process_instance_id)?)
    }

    /// Remove the jobs of a deleted process instance.
    pub fn delete_jobs_of(&self, process_instance_id: ProcessInstanceId) -> EngineResult<usize> {
        let removed = self.store.delete_by_process_instance(process_instance_id)?;
        if removed > 0 {
            debug!(source = %self.name, process_instance_id = %process_instance_id, removed, "jobs deleted");
        }
        Ok(removed)
    }

    fn require(&self, id: JobId) -> EngineResult<Job> {
        self.store
            .find_by_id(id)?
            .ok_or_else(|| EngineError::not_found(format!("job {id}")))
    }

    fn modify(&self, name: &str, id: JobId, change: impl Fn(&mut Job)) -> EngineResult<()> {
        self.executor.command().execute(name, || {
            let mut job = self.require(id)?;
            change(&mut job);
            self.store.update(&job)?;
            Ok(())
        })
    }
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("name", &self.name)
            .field("default_retries", &self.default_retries)
            .finish_non_exhaustive()
    }
}
