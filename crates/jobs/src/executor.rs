//! Job execution with retry and incident handling.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use stepflow_core::{Clock, EngineError, EngineResult, ErrorKind, JobId};

use crate::command::CommandExecutor;
use crate::dispatcher::{Batch, BatchRunner};
use crate::handler::{HandlerRegistry, JobContext};
use crate::store::{JobStore, JobStoreError};
use crate::types::Incident;

/// Result of one job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded and the job was deleted.
    Succeeded,
    /// Handler failed; the job will be retried.
    Failed { retries: u32, error: EngineError },
    /// Handler failed and no retries are left; an incident was raised.
    Incident { error: EngineError },
    /// The job vanished or its lease was lost before it ran.
    Skipped,
    /// Infrastructure failure; the lease is left to expire, no retry consumed.
    Abandoned { error: EngineError },
    /// Conflicts outlasted the command retry budget; the lease was released.
    Conflict { error: EngineError },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded)
    }

    pub fn error(&self) -> Option<&EngineError> {
        match self {
            JobOutcome::Failed { error, .. }
            | JobOutcome::Incident { error }
            | JobOutcome::Abandoned { error }
            | JobOutcome::Conflict { error } => Some(error),
            JobOutcome::Succeeded | JobOutcome::Skipped => None,
        }
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub incidents_created: u64,
    pub jobs_skipped: u64,
    pub jobs_abandoned: u64,
    pub batches_run: u64,
    pub batches_released: u64,
    pub current_running: usize,
}

/// Runs jobs of one job source.
///
/// Each execution is a command: read the job, check the lease, run the
/// handler, delete the job. Failures never leave this type; they become
/// retry decrements, incidents or released leases.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    command: CommandExecutor,
    retry_delay: Duration,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        command: CommandExecutor,
    ) -> Self {
        Self {
            store,
            handlers,
            clock,
            command,
            retry_delay: Duration::ZERO,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    /// Delay before a failed job is due again.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn command(&self) -> CommandExecutor {
        self.command
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Execute one job. With `lock_owner` set the job only runs while that
    /// owner still holds its lease.
    pub fn execute(&self, id: JobId, lock_owner: Option<&str>) -> JobOutcome {
        self.update_stats(|s| s.current_running += 1);

        let outcome = match self
            .command
            .execute("execute-job", || self.execute_once(id, lock_owner))
        {
            Ok(outcome) => outcome,
            Err(err) => self.handle_failure(id, lock_owner, err),
        };

        self.update_stats(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            match &outcome {
                JobOutcome::Succeeded => s.jobs_succeeded += 1,
                JobOutcome::Failed { .. } | JobOutcome::Conflict { .. } => s.jobs_failed += 1,
                JobOutcome::Incident { .. } => {
                    s.jobs_failed += 1;
                    s.incidents_created += 1;
                }
                JobOutcome::Skipped => s.jobs_skipped += 1,
                JobOutcome::Abandoned { .. } => s.jobs_abandoned += 1,
            }
        });
        outcome
    }

    fn execute_once(&self, id: JobId, lock_owner: Option<&str>) -> EngineResult<JobOutcome> {
        let now = self.clock.now();
        let Some(job) = self.store.find_by_id(id)? else {
            debug!(job_id = %id, "job no longer exists");
            return Ok(JobOutcome::Skipped);
        };
        if let Some(owner) = lock_owner {
            if !job.is_locked_by(owner, now) {
                debug!(job_id = %id, owner = %owner, "lease lost before execution");
                return Ok(JobOutcome::Skipped);
            }
        }

        let handler = self.handlers.get(&job.handler_type).ok_or_else(|| {
            EngineError::invariant(format!(
                "no handler registered for job type '{}'",
                job.handler_type
            ))
        })?;

        let ctx = JobContext {
            job: &job,
            lock_owner,
            now,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| handler.execute(&ctx))) {
            Ok(result) => result?,
            Err(payload) => return Err(EngineError::failure(panic_message(payload.as_ref()))),
        }

        match self.store.record_success(&job) {
            // The handler removed the job itself (e.g. its process instance ended).
            Ok(()) | Err(JobStoreError::Conflict { found: None, .. }) => {}
            Err(err) => return Err(err.into()),
        }
        debug!(job_id = %id, handler_type = %job.handler_type, "job completed");
        Ok(JobOutcome::Succeeded)
    }

    fn handle_failure(&self, id: JobId, lock_owner: Option<&str>, err: EngineError) -> JobOutcome {
        match err.kind() {
            ErrorKind::Conflict => {
                warn!(job_id = %id, error = %err, "job execution kept conflicting, releasing lease");
                if let Some(owner) = lock_owner {
                    if let Err(e) = self.store.unlock(id, owner) {
                        error!(job_id = %id, error = %e, "failed to release lease");
                    }
                }
                JobOutcome::Conflict { error: err }
            }
            ErrorKind::Infrastructure => {
                warn!(job_id = %id, error = %err, "job abandoned, lease left to expire");
                JobOutcome::Abandoned { error: err }
            }
            ErrorKind::Programming => self.record_failure(id, err, true),
            ErrorKind::Business | ErrorKind::Caller => self.record_failure(id, err, false),
        }
    }

    /// Persist a failed attempt: decrement retries (or zero them for
    /// programming faults) and raise an incident when they run out.
    fn record_failure(&self, id: JobId, err: EngineError, terminal: bool) -> JobOutcome {
        let message = err.to_string();
        let recorded = self.command.execute("record-job-failure", || {
            let now = self.clock.now();
            let Some(job) = self.store.find_by_id(id)? else {
                return Ok(None);
            };
            let retries = if terminal {
                0
            } else {
                job.retries.saturating_sub(1)
            };
            let next_due = (retries > 0 && !self.retry_delay.is_zero()).then(|| {
                now + chrono::Duration::from_std(self.retry_delay).unwrap_or_default()
            });
            let updated = self.store.record_failure(&job, retries, &message, next_due)?;
            if updated.retries == 0 && job.retries > 0 {
                self.store
                    .insert_incident(Incident::failed_job(&updated, message.clone(), now))?;
            }
            Ok(Some(updated.retries))
        });

        match recorded {
            Ok(Some(0)) => {
                warn!(job_id = %id, error = %message, "job out of retries, incident created");
                JobOutcome::Incident { error: err }
            }
            Ok(Some(retries)) => {
                info!(job_id = %id, retries, error = %message, "job failed, will be retried");
                JobOutcome::Failed {
                    retries,
                    error: err,
                }
            }
            Ok(None) => JobOutcome::Skipped,
            Err(store_err) => {
                error!(job_id = %id, error = %store_err, cause = %message, "failed to record job failure");
                JobOutcome::Abandoned { error: err }
            }
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut ExecutorStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut stats);
    }
}

impl BatchRunner for JobExecutor {
    fn run_batch(&self, batch: &Batch) {
        self.update_stats(|s| s.batches_run += 1);
        for id in &batch.job_ids {
            let outcome = self.execute(*id, Some(&batch.lock_owner));
            if let Some(err) = outcome.error() {
                debug!(job_id = %id, error = %err, "job in batch did not succeed");
            }
        }
    }

    fn release_batch(&self, batch: &Batch) {
        self.update_stats(|s| s.batches_released += 1);
        for id in &batch.job_ids {
            if let Err(err) = self.store.unlock(*id, &batch.lock_owner) {
                error!(job_id = %id, error = %err, "failed to release lease of rejected job");
            }
        }
    }
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("handlers", &self.handlers)
            .field("command", &self.command)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
