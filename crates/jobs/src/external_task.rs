//! External tasks: work leased to remote workers through fetch-and-lock.
//!
//! A remote worker asks for up to N tasks of some topics, receives leased
//! tasks (or waits up to a response timeout for some to appear) and later
//! completes them, reports a failure or extends the lease. Every mutation is
//! checked against the worker holding the lease.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};

use stepflow_core::{
    Clock, EngineError, EngineResult, ExecutionId, ExternalTaskId, IncidentId, ProcessInstanceId,
};

use crate::types::{FAILED_EXTERNAL_TASK_INCIDENT, Incident};

/// A unit of work for a remote worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTask {
    pub id: ExternalTaskId,
    pub topic: String,
    pub worker_id: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    /// `None` until the first reported failure.
    pub retries: Option<u32>,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub priority: i64,
    pub execution_id: ExecutionId,
    pub process_instance_id: ProcessInstanceId,
    pub activity_id: String,
    /// Variables handed to the worker.
    pub variables: Map<String, JsonValue>,
    pub suspended: bool,
    pub created_at: DateTime<Utc>,
}

impl ExternalTask {
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.worker_id.is_some() && self.lock_expiration_time.is_some_and(|exp| exp > now)
    }

    fn is_fetchable_at(&self, now: DateTime<Utc>) -> bool {
        !self.suspended
            && self.retries != Some(0)
            && self.lock_expiration_time.is_none_or(|exp| exp <= now)
    }
}

/// Input for [`ExternalTaskService::create`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewExternalTask {
    pub topic: String,
    pub priority: i64,
    pub execution_id: ExecutionId,
    pub process_instance_id: ProcessInstanceId,
    pub activity_id: String,
    pub variables: Map<String, JsonValue>,
}

impl NewExternalTask {
    pub fn new(
        topic: impl Into<String>,
        execution_id: ExecutionId,
        process_instance_id: ProcessInstanceId,
        activity_id: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            priority: 0,
            execution_id,
            process_instance_id,
            activity_id: activity_id.into(),
            variables: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_variables(mut self, variables: Map<String, JsonValue>) -> Self {
        self.variables = variables;
        self
    }
}

/// One topic of a fetch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRequest {
    pub topic_name: String,
    pub lock_duration: Duration,
}

impl TopicRequest {
    pub fn new(topic_name: impl Into<String>, lock_duration: Duration) -> Self {
        Self {
            topic_name: topic_name.into(),
            lock_duration,
        }
    }
}

/// Fetch-and-lock request of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub worker_id: String,
    pub max_tasks: usize,
    pub use_priority: bool,
    pub topics: Vec<TopicRequest>,
    /// Wait up to this long for tasks when none are available.
    pub async_response_timeout: Option<Duration>,
}

impl FetchRequest {
    pub fn new(worker_id: impl Into<String>, max_tasks: usize) -> Self {
        Self {
            worker_id: worker_id.into(),
            max_tasks,
            use_priority: true,
            topics: Vec::new(),
            async_response_timeout: None,
        }
    }

    pub fn topic(mut self, topic_name: impl Into<String>, lock_duration: Duration) -> Self {
        self.topics.push(TopicRequest::new(topic_name, lock_duration));
        self
    }

    pub fn long_poll(mut self, timeout: Duration) -> Self {
        self.async_response_timeout = Some(timeout);
        self
    }
}

/// A task leased to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedExternalTask {
    pub id: ExternalTaskId,
    pub topic: String,
    pub worker_id: String,
    pub lock_expiration_time: DateTime<Utc>,
    pub retries: Option<u32>,
    pub error_message: Option<String>,
    pub priority: i64,
    pub execution_id: ExecutionId,
    pub process_instance_id: ProcessInstanceId,
    pub activity_id: String,
    pub variables: Map<String, JsonValue>,
}

/// Callback run when a worker completes a task, e.g. to move its execution on.
pub trait ExternalTaskCompletion: Send + Sync {
    fn task_completed(
        &self,
        task: &ExternalTask,
        variables: &Map<String, JsonValue>,
    ) -> EngineResult<()>;
}

#[derive(Debug, Default)]
struct State {
    tasks: BTreeMap<ExternalTaskId, ExternalTask>,
    incidents: Vec<Incident>,
}

/// Fetch-and-lock API for remote workers.
pub struct ExternalTaskService {
    state: Mutex<State>,
    available: Condvar,
    clock: Arc<dyn Clock>,
    completion: RwLock<Option<Arc<dyn ExternalTaskCompletion>>>,
}

impl ExternalTaskService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            clock,
            completion: RwLock::new(None),
        }
    }

    /// Install the callback run on completion.
    pub fn set_completion_handler(&self, handler: Arc<dyn ExternalTaskCompletion>) {
        *self.completion.write().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    pub fn create(&self, new: NewExternalTask) -> EngineResult<ExternalTaskId> {
        let task = ExternalTask {
            id: ExternalTaskId::new(),
            topic: new.topic,
            worker_id: None,
            lock_expiration_time: None,
            retries: None,
            error_message: None,
            error_details: None,
            priority: new.priority,
            execution_id: new.execution_id,
            process_instance_id: new.process_instance_id,
            activity_id: new.activity_id,
            variables: new.variables,
            suspended: false,
            created_at: self.clock.now(),
        };
        let id = task.id;
        debug!(task_id = %id, topic = %task.topic, "external task created");
        self.lock_state().tasks.insert(id, task);
        self.available.notify_all();
        Ok(id)
    }

    /// Lease up to `max_tasks` tasks of the requested topics. With a response
    /// timeout, waits for tasks to appear instead of returning empty.
    pub fn fetch_and_lock(&self, request: &FetchRequest) -> EngineResult<Vec<LockedExternalTask>> {
        if request.worker_id.is_empty() {
            return Err(EngineError::validation("worker id must not be empty"));
        }
        if request.max_tasks == 0 || request.topics.is_empty() {
            return Ok(Vec::new());
        }

        let deadline = request.async_response_timeout.map(|t| Instant::now() + t);
        let mut state = self.lock_state();
        loop {
            let locked = self.lock_tasks(&mut state, request);
            if !locked.is_empty() {
                debug!(worker_id = %request.worker_id, count = locked.len(), "external tasks locked");
                return Ok(locked);
            }
            let Some(deadline) = deadline else {
                return Ok(locked);
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(locked);
            }
            // Expiring leases and retry timeouts free tasks without a notification.
            let wait = Self::next_release(&state, request, self.clock.now())
                .map_or(remaining, |release| release.min(remaining));
            let (next, _) = self
                .available
                .wait_timeout(state, wait)
                .unwrap_or_else(|p| p.into_inner());
            state = next;
        }
    }

    /// Time until the earliest requested task whose lease or retry timeout runs out.
    fn next_release(state: &State, request: &FetchRequest, now: DateTime<Utc>) -> Option<Duration> {
        state
            .tasks
            .values()
            .filter(|t| !t.suspended && t.retries != Some(0))
            .filter(|t| request.topics.iter().any(|r| r.topic_name == t.topic))
            .filter_map(|t| t.lock_expiration_time)
            .filter(|exp| *exp > now)
            .min()
            .and_then(|exp| (exp - now).to_std().ok())
    }

    fn lock_tasks(&self, state: &mut State, request: &FetchRequest) -> Vec<LockedExternalTask> {
        let now = self.clock.now();
        let mut candidates: Vec<&ExternalTask> = state
            .tasks
            .values()
            .filter(|t| t.is_fetchable_at(now))
            .filter(|t| request.topics.iter().any(|r| r.topic_name == t.topic))
            .collect();
        candidates.sort_by(|a, b| {
            let by_age = a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id));
            if request.use_priority {
                b.priority.cmp(&a.priority).then(by_age)
            } else {
                by_age
            }
        });
        let ids: Vec<ExternalTaskId> = candidates
            .into_iter()
            .take(request.max_tasks)
            .map(|t| t.id)
            .collect();

        let mut locked = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(task) = state.tasks.get_mut(&id) else {
                continue;
            };
            let Some(topic) = request.topics.iter().find(|r| r.topic_name == task.topic) else {
                continue;
            };
            let expiration =
                now + chrono::Duration::from_std(topic.lock_duration).unwrap_or_default();
            task.worker_id = Some(request.worker_id.clone());
            task.lock_expiration_time = Some(expiration);
            locked.push(LockedExternalTask {
                id: task.id,
                topic: task.topic.clone(),
                worker_id: request.worker_id.clone(),
                lock_expiration_time: expiration,
                retries: task.retries,
                error_message: task.error_message.clone(),
                priority: task.priority,
                execution_id: task.execution_id,
                process_instance_id: task.process_instance_id,
                activity_id: task.activity_id.clone(),
                variables: task.variables.clone(),
            });
        }
        locked
    }

    /// Complete a task leased by `worker_id` and run the completion callback.
    ///
    /// The task stays claimed while the callback runs. If the callback fails
    /// the task is restored with its lease and incidents, so the worker can
    /// retry the completion or report a failure.
    pub fn complete(
        &self,
        id: ExternalTaskId,
        worker_id: &str,
        variables: Map<String, JsonValue>,
    ) -> EngineResult<()> {
        let (task, incidents) = {
            let mut state = self.lock_state();
            let now = self.clock.now();
            Self::require_locked_by(&state, id, worker_id, now)?;
            let task = state
                .tasks
                .remove(&id)
                .ok_or_else(|| EngineError::not_found(format!("external task {id}")))?;
            let (incidents, others): (Vec<Incident>, Vec<Incident>) =
                std::mem::take(&mut state.incidents)
                    .into_iter()
                    .partition(|i| i.external_task_id == Some(id));
            state.incidents = others;
            (task, incidents)
        };

        let handler = self
            .completion
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(handler) = handler {
            if let Err(err) = handler.task_completed(&task, &variables) {
                warn!(task_id = %id, worker_id = %worker_id, error = %err, "external task completion rejected, task restored");
                let mut state = self.lock_state();
                state.tasks.insert(id, task);
                state.incidents.extend(incidents);
                return Err(err);
            }
        }
        info!(task_id = %id, worker_id = %worker_id, "external task completed");
        Ok(())
    }

    /// Record a failure. The task becomes fetchable again after `retry_timeout`;
    /// with `retries == 0` an incident is raised instead.
    pub fn handle_failure(
        &self,
        id: ExternalTaskId,
        worker_id: &str,
        error_message: &str,
        error_details: Option<&str>,
        retries: u32,
        retry_timeout: Duration,
    ) -> EngineResult<()> {
        let mut state = self.lock_state();
        let now = self.clock.now();
        Self::require_locked_by(&state, id, worker_id, now)?;

        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found(format!("external task {id}")))?;
        let was_failed = task.retries == Some(0);
        task.retries = Some(retries);
        task.error_message = Some(error_message.to_string());
        task.error_details = error_details.map(str::to_string);
        task.lock_expiration_time =
            Some(now + chrono::Duration::from_std(retry_timeout).unwrap_or_default());
        let snapshot = task.clone();

        if retries == 0 && !was_failed {
            warn!(task_id = %id, error = %error_message, "external task out of retries, incident created");
            state.incidents.push(failed_task_incident(&snapshot, error_message, now));
        } else {
            debug!(task_id = %id, retries, "external task failure recorded");
        }
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    /// Extend the lease held by `worker_id` to `now + new_duration`.
    pub fn extend_lock(
        &self,
        id: ExternalTaskId,
        worker_id: &str,
        new_duration: Duration,
    ) -> EngineResult<()> {
        let mut state = self.lock_state();
        let now = self.clock.now();
        Self::require_locked_by(&state, id, worker_id, now)?;
        if let Some(task) = state.tasks.get_mut(&id) {
            task.lock_expiration_time =
                Some(now + chrono::Duration::from_std(new_duration).unwrap_or_default());
        }
        Ok(())
    }

    /// Release the lease, whoever holds it.
    pub fn unlock(&self, id: ExternalTaskId) -> EngineResult<()> {
        let mut state = self.lock_state();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found(format!("external task {id}")))?;
        task.worker_id = None;
        task.lock_expiration_time = None;
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    /// Set retries; raising them above 0 resolves the task's incident.
    pub fn set_retries(&self, id: ExternalTaskId, retries: u32) -> EngineResult<()> {
        let mut state = self.lock_state();
        let now = self.clock.now();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found(format!("external task {id}")))?;
        let was_failed = task.retries == Some(0);
        task.retries = Some(retries);
        let snapshot = task.clone();

        if was_failed && retries > 0 {
            state.incidents.retain(|i| i.external_task_id != Some(id));
        } else if !was_failed && retries == 0 {
            state
                .incidents
                .push(failed_task_incident(&snapshot, "retries set to 0", now));
        }
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    pub fn find(&self, id: ExternalTaskId) -> Option<ExternalTask> {
        self.lock_state().tasks.get(&id).cloned()
    }

    pub fn list_by_topic(&self, topic: &str) -> Vec<ExternalTask> {
        self.lock_state()
            .tasks
            .values()
            .filter(|t| t.topic == topic)
            .cloned()
            .collect()
    }

    pub fn incidents(&self) -> Vec<Incident> {
        self.lock_state().incidents.clone()
    }

    /// Remove the tasks of a deleted process instance.
    pub fn delete_by_process_instance(&self, process_instance_id: ProcessInstanceId) -> usize {
        let mut state = self.lock_state();
        let before = state.tasks.len();
        state
            .tasks
            .retain(|_, t| t.process_instance_id != process_instance_id);
        state
            .incidents
            .retain(|i| i.external_task_id.is_none() || i.process_instance_id != Some(process_instance_id));
        before - state.tasks.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn require_locked_by<'a>(
        state: &'a State,
        id: ExternalTaskId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<&'a ExternalTask> {
        let task = state
            .tasks
            .get(&id)
            .ok_or_else(|| EngineError::not_found(format!("external task {id}")))?;
        match task.worker_id.as_deref() {
            Some(owner) if owner == worker_id && task.is_locked_at(now) => Ok(task),
            Some(owner) if owner != worker_id => Err(EngineError::validation(format!(
                "external task {id} is locked by worker '{owner}', not '{worker_id}'"
            ))),
            _ => Err(EngineError::validation(format!(
                "external task {id} is not locked by worker '{worker_id}'"
            ))),
        }
    }
}

impl std::fmt::Debug for ExternalTaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalTaskService").finish_non_exhaustive()
    }
}

fn failed_task_incident(task: &ExternalTask, message: &str, now: DateTime<Utc>) -> Incident {
    Incident {
        id: IncidentId::new(),
        incident_type: FAILED_EXTERNAL_TASK_INCIDENT.to_string(),
        job_id: None,
        external_task_id: Some(task.id),
        process_instance_id: Some(task.process_instance_id),
        execution_id: Some(task.execution_id),
        message: message.to_string(),
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use serde_json::json;
    use stepflow_core::ManualClock;

    const LOCK: Duration = Duration::from_secs(60);

    fn service() -> (Arc<ExternalTaskService>, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        (Arc::new(ExternalTaskService::new(Arc::new(clock.clone()))), clock)
    }

    fn task(service: &ExternalTaskService, topic: &str, priority: i64) -> ExternalTaskId {
        let pi = ProcessInstanceId::new();
        service
            .create(
                NewExternalTask::new(topic, pi.root_execution_id(), pi, "charge").with_priority(priority),
            )
            .unwrap()
    }

    #[test]
    fn fetch_locks_by_priority_and_topic() {
        let (service, _clock) = service();
        let low = task(&service, "payments", 1);
        let high = task(&service, "payments", 9);
        task(&service, "mail", 100);

        let request = FetchRequest::new("w1", 1).topic("payments", LOCK);
        let locked = service.fetch_and_lock(&request).unwrap();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].id, high);

        let locked = service.fetch_and_lock(&request).unwrap();
        assert_eq!(locked[0].id, low);
        assert!(service.fetch_and_lock(&request).unwrap().is_empty());
    }

    #[test]
    fn only_lock_holder_may_complete() {
        let (service, _clock) = service();
        let id = task(&service, "payments", 0);
        service
            .fetch_and_lock(&FetchRequest::new("w1", 5).topic("payments", LOCK))
            .unwrap();

        let err = service.complete(id, "w2", Map::new()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        service.complete(id, "w1", Map::new()).unwrap();
        assert!(service.find(id).is_none());
    }

    #[test]
    fn expired_lease_can_be_fetched_by_another_worker() {
        let (service, clock) = service();
        let id = task(&service, "payments", 0);
        service
            .fetch_and_lock(&FetchRequest::new("w1", 5).topic("payments", LOCK))
            .unwrap();
        clock.advance(LOCK + Duration::from_secs(1));

        let locked = service
            .fetch_and_lock(&FetchRequest::new("w2", 5).topic("payments", LOCK))
            .unwrap();
        assert_eq!(locked[0].id, id);
        assert!(service.complete(id, "w1", Map::new()).is_err());
    }

    #[test]
    fn failure_with_retry_timeout_and_incident() {
        let (service, clock) = service();
        let id = task(&service, "payments", 0);
        let request = FetchRequest::new("w1", 5).topic("payments", LOCK);
        service.fetch_and_lock(&request).unwrap();

        service
            .handle_failure(id, "w1", "gateway down", None, 1, Duration::from_secs(30))
            .unwrap();
        assert!(service.fetch_and_lock(&request).unwrap().is_empty());
        clock.advance(Duration::from_secs(31));
        let again = service.fetch_and_lock(&request).unwrap();
        assert_eq!(again[0].retries, Some(1));
        assert_eq!(again[0].error_message.as_deref(), Some("gateway down"));

        service
            .handle_failure(id, "w1", "gateway down", Some("trace"), 0, Duration::ZERO)
            .unwrap();
        assert_eq!(service.incidents().len(), 1);
        assert!(service.fetch_and_lock(&request).unwrap().is_empty());

        service.set_retries(id, 2).unwrap();
        assert!(service.incidents().is_empty());
        assert_eq!(service.fetch_and_lock(&request).unwrap().len(), 1);
    }

    #[test]
    fn extend_lock_requires_live_lease() {
        let (service, clock) = service();
        let id = task(&service, "payments", 0);
        service
            .fetch_and_lock(&FetchRequest::new("w1", 5).topic("payments", LOCK))
            .unwrap();
        service.extend_lock(id, "w1", Duration::from_secs(600)).unwrap();
        clock.advance(Duration::from_secs(300));
        assert!(service.find(id).unwrap().is_locked_at(clock.now()));

        clock.advance(Duration::from_secs(301));
        assert!(service.extend_lock(id, "w1", LOCK).is_err());
    }

    #[test]
    fn long_poll_returns_when_task_appears() {
        let (service, _clock) = service();
        let poller = {
            let service = service.clone();
            thread::spawn(move || {
                service.fetch_and_lock(
                    &FetchRequest::new("w1", 5)
                        .topic("payments", LOCK)
                        .long_poll(Duration::from_secs(10)),
                )
            })
        };
        thread::sleep(Duration::from_millis(50));
        let id = task(&service, "payments", 0);

        let locked = poller.join().unwrap().unwrap();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].id, id);
    }

    #[test]
    fn long_poll_returns_when_lease_expires() {
        let (service, clock) = service();
        let id = task(&service, "payments", 0);
        service
            .fetch_and_lock(&FetchRequest::new("w1", 5).topic("payments", Duration::from_millis(20)))
            .unwrap();

        let poller = {
            let service = service.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let locked = service.fetch_and_lock(
                    &FetchRequest::new("w2", 5)
                        .topic("payments", LOCK)
                        .long_poll(Duration::from_secs(30)),
                );
                (locked, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        clock.advance(Duration::from_secs(1));

        let (locked, waited) = poller.join().unwrap();
        let locked = locked.unwrap();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].id, id);
        assert_eq!(locked[0].worker_id, "w2");
        assert!(waited < Duration::from_secs(10));
    }

    #[test]
    fn long_poll_returns_when_retry_timeout_passes() {
        let (service, clock) = service();
        let id = task(&service, "payments", 0);
        service
            .fetch_and_lock(&FetchRequest::new("w1", 5).topic("payments", LOCK))
            .unwrap();
        service
            .handle_failure(id, "w1", "gateway down", None, 2, Duration::from_millis(20))
            .unwrap();

        let poller = {
            let service = service.clone();
            thread::spawn(move || {
                service.fetch_and_lock(
                    &FetchRequest::new("w1", 5)
                        .topic("payments", LOCK)
                        .long_poll(Duration::from_secs(30)),
                )
            })
        };
        thread::sleep(Duration::from_millis(50));
        clock.advance(Duration::from_secs(1));

        let locked = poller.join().unwrap().unwrap();
        assert_eq!(locked[0].id, id);
        assert_eq!(locked[0].retries, Some(2));
    }

    #[test]
    fn long_poll_times_out_empty() {
        let (service, _clock) = service();
        let started = Instant::now();
        let locked = service
            .fetch_and_lock(
                &FetchRequest::new("w1", 5)
                    .topic("payments", LOCK)
                    .long_poll(Duration::from_millis(50)),
            )
            .unwrap();
        assert!(locked.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn failed_completion_keeps_the_task() {
        struct Reject;
        impl ExternalTaskCompletion for Reject {
            fn task_completed(
                &self,
                _task: &ExternalTask,
                _variables: &Map<String, JsonValue>,
            ) -> EngineResult<()> {
                Err(EngineError::optimistic_locking("instance changed concurrently"))
            }
        }

        let (service, _clock) = service();
        service.set_completion_handler(Arc::new(Reject));
        let id = task(&service, "payments", 0);
        let request = FetchRequest::new("w1", 5).topic("payments", LOCK);
        service.fetch_and_lock(&request).unwrap();
        service.set_retries(id, 0).unwrap();
        assert_eq!(service.incidents().len(), 1);

        let err = service.complete(id, "w1", Map::new()).unwrap_err();
        assert!(matches!(err, EngineError::OptimisticLocking(_)));
        let kept = service.find(id).unwrap();
        assert_eq!(kept.worker_id.as_deref(), Some("w1"));
        assert_eq!(service.incidents().len(), 1);

        // The lease survives, so the worker can report the failure instead.
        service
            .handle_failure(id, "w1", "could not complete", None, 1, Duration::ZERO)
            .unwrap();
        assert_eq!(service.find(id).unwrap().retries, Some(1));
    }

    #[test]
    fn completion_callback_receives_variables() {
        struct Count(AtomicUsize);
        impl ExternalTaskCompletion for Count {
            fn task_completed(
                &self,
                _task: &ExternalTask,
                variables: &Map<String, JsonValue>,
            ) -> EngineResult<()> {
                assert_eq!(variables.get("paid"), Some(&json!(true)));
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let (service, _clock) = service();
        let count = Arc::new(Count(AtomicUsize::new(0)));
        service.set_completion_handler(count.clone());
        let id = task(&service, "payments", 0);
        service
            .fetch_and_lock(&FetchRequest::new("w1", 5).topic("payments", LOCK))
            .unwrap();

        let mut vars = Map::new();
        vars.insert("paid".into(), json!(true));
        service.complete(id, "w1", vars).unwrap();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
    }
}
