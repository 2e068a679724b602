//! Job storage.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use stepflow_core::{EngineError, JobId, ProcessInstanceId};

use crate::types::{AcquirableJob, AcquisitionOrder, Incident, Job, JobFilter};

/// Job store abstraction.
///
/// Every write bumps the job revision. `update` is revision-checked; `try_lock`
/// and `unlock` are conditional updates that report a lost race as `false`.
pub trait JobStore: Send + Sync {
    /// Insert a new job. The stored copy (revision 1) is returned.
    fn insert(&self, job: Job) -> Result<Job, JobStoreError>;

    fn find_by_id(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Acquirable jobs at `now`, sorted by `order`, at most `limit`.
    fn find_due_unlocked(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        order: AcquisitionOrder,
    ) -> Result<Vec<AcquirableJob>, JobStoreError>;

    /// Lease the job to `owner` until `now + lock_time` if it is still
    /// acquirable. Returns whether this caller won the lease.
    fn try_lock(
        &self,
        id: JobId,
        owner: &str,
        lock_time: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Clear the lease if `owner` holds it.
    fn unlock(&self, id: JobId, owner: &str) -> Result<bool, JobStoreError>;

    /// Write `job` if its revision still matches the stored one.
    fn update(&self, job: &Job) -> Result<Job, JobStoreError>;

    /// Store a failed attempt: new retry count, message and next due date.
    /// With retries left the lease is released; at 0 the lease is kept until
    /// it expires. Conditional on `job.revision`.
    fn record_failure(
        &self,
        job: &Job,
        retries: u32,
        exception_message: &str,
        next_due: Option<DateTime<Utc>>,
    ) -> Result<Job, JobStoreError>;

    /// Delete a successfully executed job. Conditional on `job.revision`.
    fn record_success(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Delete a job together with its incidents.
    fn delete(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn find_by_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<Job>, JobStoreError>;

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// Delete every job of a process instance. Returns how many were removed.
    fn delete_by_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<usize, JobStoreError>;

    fn insert_incident(&self, incident: Incident) -> Result<(), JobStoreError>;

    /// Remove the open incidents of a job. Returns how many were resolved.
    fn resolve_incidents(&self, job_id: JobId) -> Result<usize, JobStoreError>;

    fn list_incidents(
        &self,
        process_instance_id: Option<ProcessInstanceId>,
    ) -> Result<Vec<Incident>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id} was modified concurrently (expected revision {expected}, found {found:?})")]
    Conflict {
        id: JobId,
        expected: u64,
        found: Option<u64>,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for EngineError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::Conflict { .. } => EngineError::optimistic_locking(err.to_string()),
            JobStoreError::NotFound(_) => EngineError::not_found(err.to_string()),
            JobStoreError::AlreadyExists(_) => EngineError::invariant(err.to_string()),
            JobStoreError::Storage(_) => EngineError::infrastructure(err.to_string()),
        }
    }
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("lock poisoned".to_string())
}

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<JobId, Job>,
    incidents: Vec<Incident>,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored jobs.
    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, mut job: Job) -> Result<Job, JobStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        if state.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        job.revision = 1;
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn find_by_id(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.jobs.get(&id).cloned())
    }

    fn find_due_unlocked(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        order: AcquisitionOrder,
    ) -> Result<Vec<AcquirableJob>, JobStoreError> {
        let state = self.state.read().map_err(poisoned)?;
        let mut candidates: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| j.is_acquirable_at(now))
            .collect();
        candidates.sort_by(|a, b| order.compare(a, b));
        Ok(candidates
            .into_iter()
            .take(limit)
            .map(AcquirableJob::from)
            .collect())
    }

    fn try_lock(
        &self,
        id: JobId,
        owner: &str,
        lock_time: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !job.is_acquirable_at(now) {
            return Ok(false);
        }
        let lease = chrono::Duration::from_std(lock_time)
            .map_err(|e| JobStoreError::Storage(format!("invalid lock time: {e}")))?;
        job.lock_owner = Some(owner.to_string());
        job.lock_expiration_time = Some(now + lease);
        job.revision += 1;
        Ok(true)
    }

    fn unlock(&self, id: JobId, owner: &str) -> Result<bool, JobStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        match state.jobs.get_mut(&id) {
            Some(job) if job.lock_owner.as_deref() == Some(owner) => {
                job.reset_lock();
                job.revision += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn update(&self, job: &Job) -> Result<Job, JobStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let stored = state
            .jobs
            .get_mut(&job.id)
            .ok_or(JobStoreError::NotFound(job.id))?;
        if stored.revision != job.revision {
            return Err(JobStoreError::Conflict {
                id: job.id,
                expected: job.revision,
                found: Some(stored.revision),
            });
        }
        let mut next = job.clone();
        next.revision += 1;
        *stored = next.clone();
        Ok(next)
    }

    fn record_failure(
        &self,
        job: &Job,
        retries: u32,
        exception_message: &str,
        next_due: Option<DateTime<Utc>>,
    ) -> Result<Job, JobStoreError> {
        let mut next = job.clone();
        next.retries = retries;
        next.exception_message = Some(exception_message.to_string());
        if retries > 0 {
            next.reset_lock();
            if next_due.is_some() {
                next.due_date = next_due;
            }
        }
        self.update(&next)
    }

    fn record_success(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let found = state.jobs.get(&job.id).map(|j| j.revision);
        if found != Some(job.revision) {
            return Err(JobStoreError::Conflict {
                id: job.id,
                expected: job.revision,
                found,
            });
        }
        state.jobs.remove(&job.id);
        state.incidents.retain(|i| i.job_id != Some(job.id));
        Ok(())
    }

    fn find_by_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.list(&JobFilter::for_process_instance(process_instance_id))
    }

    fn delete(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let removed = state.jobs.remove(&id);
        if removed.is_some() {
            state.incidents.retain(|i| i.job_id != Some(id));
        }
        Ok(removed)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let state = self.state.read().map_err(poisoned)?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    fn delete_by_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<usize, JobStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, j| j.process_instance_id != Some(process_instance_id));
        let removed = before - state.jobs.len();
        state
            .incidents
            .retain(|i| i.job_id.is_none() || i.process_instance_id != Some(process_instance_id));
        Ok(removed)
    }

    fn insert_incident(&self, incident: Incident) -> Result<(), JobStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        state.incidents.push(incident);
        Ok(())
    }

    fn resolve_incidents(&self, job_id: JobId) -> Result<usize, JobStoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let before = state.incidents.len();
        state.incidents.retain(|i| i.job_id != Some(job_id));
        Ok(before - state.incidents.len())
    }

    fn list_incidents(
        &self,
        process_instance_id: Option<ProcessInstanceId>,
    ) -> Result<Vec<Incident>, JobStoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .incidents
            .iter()
            .filter(|i| process_instance_id.is_none_or(|pi| i.process_instance_id == Some(pi)))
            .cloned()
            .collect())
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        (**self).insert(job)
    }

    fn find_by_id(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).find_by_id(id)
    }

    fn find_due_unlocked(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        order: AcquisitionOrder,
    ) -> Result<Vec<AcquirableJob>, JobStoreError> {
        (**self).find_due_unlocked(now, limit, order)
    }

    fn try_lock(
        &self,
        id: JobId,
        owner: &str,
        lock_time: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        (**self).try_lock(id, owner, lock_time, now)
    }

    fn unlock(&self, id: JobId, owner: &str) -> Result<bool, JobStoreError> {
        (**self).unlock(id, owner)
    }

    fn update(&self, job: &Job) -> Result<Job, JobStoreError> {
        (**self).update(job)
    }

    fn record_failure(
        &self,
        job: &Job,
        retries: u32,
        exception_message: &str,
        next_due: Option<DateTime<Utc>>,
    ) -> Result<Job, JobStoreError> {
        (**self).record_failure(job, retries, exception_message, next_due)
    }

    fn record_success(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).record_success(job)
    }

    fn delete(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).delete(id)
    }

    fn find_by_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_by_process_instance(process_instance_id)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(filter)
    }

    fn delete_by_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<usize, JobStoreError> {
        (**self).delete_by_process_instance(process_instance_id)
    }

    fn insert_incident(&self, incident: Incident) -> Result<(), JobStoreError> {
        (**self).insert_incident(incident)
    }

    fn resolve_incidents(&self, job_id: JobId) -> Result<usize, JobStoreError> {
        (**self).resolve_incidents(job_id)
    }

    fn list_incidents(
        &self,
        process_instance_id: Option<ProcessInstanceId>,
    ) -> Result<Vec<Incident>, JobStoreError> {
        (**self).list_incidents(process_instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewJob;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(300);

    fn new_job(store: &InMemoryJobStore, priority: i64, now: DateTime<Utc>) -> Job {
        let job = NewJob::new("test", json!({}))
            .with_priority(priority)
            .into_job(JobId::new(), 3, now);
        store.insert(job).unwrap()
    }

    #[test]
    fn insert_assigns_first_revision_and_rejects_duplicates() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = new_job(&store, 0, now);
        assert_eq!(job.revision, 1);

        let err = store.insert(job.clone()).unwrap_err();
        assert_eq!(err, JobStoreError::AlreadyExists(job.id));
    }

    #[test]
    fn find_due_unlocked_orders_and_limits() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let low = new_job(&store, 1, now);
        let high = new_job(&store, 9, now);
        let mid = new_job(&store, 5, now);

        let found = store
            .find_due_unlocked(now, 2, AcquisitionOrder::Priority)
            .unwrap();
        let ids: Vec<_> = found.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high.id, mid.id]);

        let by_due = store
            .find_due_unlocked(now, 10, AcquisitionOrder::DueDate)
            .unwrap();
        assert_eq!(by_due[0].id, low.id);
    }

    #[test]
    fn try_lock_is_exclusive_until_expiry() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = new_job(&store, 0, now);

        assert!(store.try_lock(job.id, "a", LEASE, now).unwrap());
        assert!(!store.try_lock(job.id, "b", LEASE, now).unwrap());
        assert!(store
            .find_due_unlocked(now, 10, AcquisitionOrder::Priority)
            .unwrap()
            .is_empty());

        let later = now + chrono::Duration::seconds(301);
        assert!(store.try_lock(job.id, "b", LEASE, later).unwrap());
        let stored = store.find_by_id(job.id).unwrap().unwrap();
        assert_eq!(stored.lock_owner.as_deref(), Some("b"));
        assert_eq!(stored.revision, 3);
    }

    #[test]
    fn try_lock_on_missing_job_loses() {
        let store = InMemoryJobStore::new();
        assert!(!store.try_lock(JobId::new(), "a", LEASE, Utc::now()).unwrap());
    }

    #[test]
    fn unlock_requires_owner() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = new_job(&store, 0, now);
        store.try_lock(job.id, "a", LEASE, now).unwrap();

        assert!(!store.unlock(job.id, "b").unwrap());
        assert!(store.unlock(job.id, "a").unwrap());
        assert!(store.try_lock(job.id, "b", LEASE, now).unwrap());
    }

    #[test]
    fn stale_update_conflicts() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = new_job(&store, 0, now);

        let mut first = job.clone();
        first.priority = 4;
        let written = store.update(&first).unwrap();
        assert_eq!(written.revision, 2);

        let mut stale = job;
        stale.priority = 8;
        let err = store.update(&stale).unwrap_err();
        assert!(matches!(
            err,
            JobStoreError::Conflict {
                expected: 1,
                found: Some(2),
                ..
            }
        ));
        assert!(EngineError::from(err).is_optimistic_locking());
    }

    #[test]
    fn record_failure_releases_lease_until_last_retry() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = new_job(&store, 0, now);
        store.try_lock(job.id, "a", LEASE, now).unwrap();
        let locked = store.find_by_id(job.id).unwrap().unwrap();

        let retry_at = now + chrono::Duration::seconds(5);
        let failed = store
            .record_failure(&locked, 2, "boom", Some(retry_at))
            .unwrap();
        assert_eq!(failed.retries, 2);
        assert!(failed.lock_owner.is_none());
        assert_eq!(failed.due_date, Some(retry_at));

        store.try_lock(job.id, "a", LEASE, retry_at).unwrap();
        let locked = store.find_by_id(job.id).unwrap().unwrap();
        let terminal = store.record_failure(&locked, 0, "boom", None).unwrap();
        assert_eq!(terminal.lock_owner.as_deref(), Some("a"));
        assert_eq!(terminal.exception_message.as_deref(), Some("boom"));
    }

    #[test]
    fn record_success_is_revision_checked() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = new_job(&store, 0, now);
        store.try_lock(job.id, "a", LEASE, now).unwrap();

        // The copy read before locking is stale.
        let err = store.record_success(&job).unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict { .. }));

        let current = store.find_by_id(job.id).unwrap().unwrap();
        store.record_success(&current).unwrap();
        assert!(store.find_by_id(job.id).unwrap().is_none());
    }

    #[test]
    fn delete_removes_incidents() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = new_job(&store, 0, now);
        store
            .insert_incident(Incident::failed_job(&job, "boom", now))
            .unwrap();
        assert_eq!(store.list_incidents(None).unwrap().len(), 1);

        assert!(store.delete(job.id).unwrap().is_some());
        assert!(store.list_incidents(None).unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn delete_by_process_instance_only_touches_that_instance() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let pi = ProcessInstanceId::new();
        let other = ProcessInstanceId::new();
        for target in [pi, pi, other] {
            let job = NewJob::new("test", json!({}))
                .for_execution(target.root_execution_id(), target)
                .into_job(JobId::new(), 3, now);
            store.insert(job).unwrap();
        }

        assert_eq!(store.delete_by_process_instance(pi).unwrap(), 2);
        let left = store.list(&JobFilter::default()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].process_instance_id, Some(other));
    }
}
