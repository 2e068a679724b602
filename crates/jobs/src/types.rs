//! Core job types.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stepflow_core::{
    DeploymentId, ExecutionId, ExternalTaskId, IncidentId, JobId, ProcessDefinitionId,
    ProcessInstanceId,
};

/// Incident type raised when a job runs out of retries.
pub const FAILED_JOB_INCIDENT: &str = "failedJob";

/// Incident type raised when an external task runs out of retries.
pub const FAILED_EXTERNAL_TASK_INCIDENT: &str = "failedExternalTask";

/// A durable, lockable unit of deferred engine work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Selects the handler that performs the work.
    pub handler_type: String,
    /// Opaque handler payload.
    pub handler_configuration: JsonValue,
    /// `None` means due immediately.
    pub due_date: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    /// Remaining attempts; 0 marks the job failed-terminal.
    pub retries: u32,
    /// Higher priorities are acquired first.
    pub priority: i64,
    pub execution_id: Option<ExecutionId>,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub process_definition_id: Option<ProcessDefinitionId>,
    pub deployment_id: Option<DeploymentId>,
    /// Message of the last failure.
    pub exception_message: Option<String>,
    /// Suspended jobs are never acquired.
    pub suspended: bool,
    /// Optimistic version, bumped by every write.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.due_date.is_none_or(|due| due <= now)
    }

    /// Locked by someone and the lease has not run out yet.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration_time.is_some_and(|exp| exp > now)
    }

    pub fn is_locked_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.is_locked_at(now) && self.lock_owner.as_deref() == Some(owner)
    }

    pub fn is_failed(&self) -> bool {
        self.retries == 0
    }

    /// Eligible for acquisition at `now`.
    pub fn is_acquirable_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_failed() && !self.suspended && self.is_due_at(now) && !self.is_locked_at(now)
    }

    pub(crate) fn reset_lock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }
}

/// Builder for a job that does not exist yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub handler_type: String,
    pub handler_configuration: JsonValue,
    pub due_date: Option<DateTime<Utc>>,
    pub priority: i64,
    /// `None` uses the job source's default retries.
    pub retries: Option<u32>,
    pub execution_id: Option<ExecutionId>,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub process_definition_id: Option<ProcessDefinitionId>,
    pub deployment_id: Option<DeploymentId>,
}

impl NewJob {
    pub fn new(handler_type: impl Into<String>, handler_configuration: JsonValue) -> Self {
        Self {
            handler_type: handler_type.into(),
            handler_configuration,
            due_date: None,
            priority: 0,
            retries: None,
            execution_id: None,
            process_instance_id: None,
            process_definition_id: None,
            deployment_id: None,
        }
    }

    /// Attach the job to an execution of a process instance.
    pub fn for_execution(
        mut self,
        execution_id: ExecutionId,
        process_instance_id: ProcessInstanceId,
    ) -> Self {
        self.execution_id = Some(execution_id);
        self.process_instance_id = Some(process_instance_id);
        self
    }

    pub fn with_definition(
        mut self,
        process_definition_id: ProcessDefinitionId,
        deployment_id: DeploymentId,
    ) -> Self {
        self.process_definition_id = Some(process_definition_id);
        self.deployment_id = Some(deployment_id);
        self
    }

    pub fn due_at(mut self, at: DateTime<Utc>) -> Self {
        self.due_date = Some(at);
        self
    }

    /// Due `delay` after `now`.
    pub fn delayed(mut self, now: DateTime<Utc>, delay: Duration) -> Self {
        self.due_date = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn into_job(self, id: JobId, default_retries: u32, now: DateTime<Utc>) -> Job {
        Job {
            id,
            handler_type: self.handler_type,
            handler_configuration: self.handler_configuration,
            due_date: self.due_date,
            lock_owner: None,
            lock_expiration_time: None,
            retries: self.retries.unwrap_or(default_retries),
            priority: self.priority,
            execution_id: self.execution_id,
            process_instance_id: self.process_instance_id,
            process_definition_id: self.process_definition_id,
            deployment_id: self.deployment_id,
            exception_message: None,
            suspended: false,
            revision: 0,
            created_at: now,
        }
    }
}

/// Ordering applied to acquisition candidates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionOrder {
    /// Priority desc, then due date asc, then id asc.
    #[default]
    Priority,
    /// Due date asc, then id asc.
    DueDate,
}

impl AcquisitionOrder {
    /// `None` due dates sort first: they are due since creation.
    pub fn compare(&self, a: &Job, b: &Job) -> Ordering {
        let by_due = a.due_date.cmp(&b.due_date).then(a.id.cmp(&b.id));
        match self {
            AcquisitionOrder::Priority => b.priority.cmp(&a.priority).then(by_due),
            AcquisitionOrder::DueDate => by_due,
        }
    }
}

/// An acquisition candidate: the job id plus what batching and dispatch need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquirableJob {
    pub id: JobId,
    pub priority: i64,
    pub due_date: Option<DateTime<Utc>>,
    pub handler_type: String,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub deployment_id: Option<DeploymentId>,
}

impl From<&Job> for AcquirableJob {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            priority: job.priority,
            due_date: job.due_date,
            handler_type: job.handler_type.clone(),
            process_instance_id: job.process_instance_id,
            deployment_id: job.deployment_id,
        }
    }
}

/// Operator-visible record of work that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub incident_type: String,
    pub job_id: Option<JobId>,
    pub external_task_id: Option<ExternalTaskId>,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub execution_id: Option<ExecutionId>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Incident {
    pub fn failed_job(job: &Job, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: IncidentId::new(),
            incident_type: FAILED_JOB_INCIDENT.to_string(),
            job_id: Some(job.id),
            external_task_id: None,
            process_instance_id: job.process_instance_id,
            execution_id: job.execution_id,
            message: message.into(),
            created_at: now,
        }
    }
}

/// Filter for job listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub process_instance_id: Option<ProcessInstanceId>,
    pub handler_type: Option<String>,
    /// Only jobs without retries left.
    pub failed_only: bool,
    pub suspended: Option<bool>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn for_process_instance(process_instance_id: ProcessInstanceId) -> Self {
        Self {
            process_instance_id: Some(process_instance_id),
            ..Default::default()
        }
    }

    pub fn failed() -> Self {
        Self {
            failed_only: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.process_instance_id
            .is_none_or(|pi| job.process_instance_id == Some(pi))
            && self
                .handler_type
                .as_deref()
                .is_none_or(|t| job.handler_type == t)
            && (!self.failed_only || job.is_failed())
            && self.suspended.is_none_or(|s| job.suspended == s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: u128, priority: i64, due: Option<DateTime<Utc>>) -> Job {
        let mut job = NewJob::new("test", JsonValue::Null)
            .with_priority(priority)
            .into_job(JobId::from_u128(id), 3, Utc::now());
        job.due_date = due;
        job
    }

    #[test]
    fn priority_order_breaks_ties_by_due_date_then_id() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(10);
        let mut jobs = vec![
            job(3, 5, Some(now)),
            job(1, 1, None),
            job(4, 5, Some(earlier)),
            job(2, 5, Some(now)),
        ];
        jobs.sort_by(|a, b| AcquisitionOrder::Priority.compare(a, b));
        let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(
            ids,
            vec![
                JobId::from_u128(4),
                JobId::from_u128(2),
                JobId::from_u128(3),
                JobId::from_u128(1)
            ]
        );
    }

    #[test]
    fn due_date_order_ignores_priority() {
        let now = Utc::now();
        let mut jobs = vec![job(2, 10, Some(now)), job(1, 0, None)];
        jobs.sort_by(|a, b| AcquisitionOrder::DueDate.compare(a, b));
        assert_eq!(jobs[0].id, JobId::from_u128(1));
    }

    #[test]
    fn acquirability_rules() {
        let now = Utc::now();
        let mut j = job(1, 0, None);
        assert!(j.is_acquirable_at(now));

        j.due_date = Some(now + chrono::Duration::seconds(1));
        assert!(!j.is_acquirable_at(now));
        j.due_date = None;

        j.lock_owner = Some("node-a".into());
        j.lock_expiration_time = Some(now + chrono::Duration::seconds(30));
        assert!(!j.is_acquirable_at(now));
        assert!(j.is_locked_by("node-a", now));

        // Expired lease is reclaimable.
        j.lock_expiration_time = Some(now);
        assert!(j.is_acquirable_at(now));

        j.reset_lock();
        j.suspended = true;
        assert!(!j.is_acquirable_at(now));

        j.suspended = false;
        j.retries = 0;
        assert!(!j.is_acquirable_at(now));
    }

    #[test]
    fn filter_matches() {
        let pi = ProcessInstanceId::from_u128(9);
        let mut j = job(1, 0, None);
        assert!(!JobFilter::for_process_instance(pi).matches(&j));
        j.process_instance_id = Some(pi);
        assert!(JobFilter::for_process_instance(pi).matches(&j));
        assert!(!JobFilter::failed().matches(&j));
        j.retries = 0;
        assert!(JobFilter::failed().matches(&j));
    }
}
