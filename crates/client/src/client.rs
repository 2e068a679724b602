//! Polling client: fetches tasks of the subscribed topics and hands each one
//! to its topic's handler.

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use serde_json::{Map, Value as JsonValue};
use tracing::{debug, error, info, warn};

use stepflow_jobs::{FetchRequest, LockedExternalTask};

use crate::backoff::{BackoffStrategy, ExponentialBackoff};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::transport::ExternalTaskTransport;

/// Operations a handler may perform on the task it was given.
pub struct TaskService<'a> {
    transport: &'a dyn ExternalTaskTransport,
    worker_id: &'a str,
}

impl TaskService<'_> {
    pub fn worker_id(&self) -> &str {
        self.worker_id
    }

    pub fn complete(
        &self,
        task: &LockedExternalTask,
        variables: Map<String, JsonValue>,
    ) -> Result<(), ClientError> {
        Ok(self.transport.complete(task.id, self.worker_id, variables)?)
    }

    /// Report a failure; with `retries == 0` the engine raises an incident.
    pub fn handle_failure(
        &self,
        task: &LockedExternalTask,
        error_message: &str,
        error_details: Option<&str>,
        retries: u32,
        retry_timeout: Duration,
    ) -> Result<(), ClientError> {
        Ok(self.transport.handle_failure(
            task.id,
            self.worker_id,
            error_message,
            error_details,
            retries,
            retry_timeout,
        )?)
    }

    pub fn extend_lock(&self, task: &LockedExternalTask, duration: Duration) -> Result<(), ClientError> {
        Ok(self.transport.extend_lock(task.id, self.worker_id, duration)?)
    }

    pub fn unlock(&self, task: &LockedExternalTask) -> Result<(), ClientError> {
        Ok(self.transport.unlock(task.id)?)
    }
}

/// Work done for the tasks of one topic.
///
/// A handler that returns an error without reporting the task leaves its
/// lease to expire, after which the task is fetched again.
pub trait ExternalTaskHandler: Send + Sync {
    fn execute(&self, task: &LockedExternalTask, service: &TaskService<'_>) -> Result<(), ClientError>;
}

impl<F> ExternalTaskHandler for F
where
    F: Fn(&LockedExternalTask, &TaskService<'_>) -> Result<(), ClientError> + Send + Sync,
{
    fn execute(&self, task: &LockedExternalTask, service: &TaskService<'_>) -> Result<(), ClientError> {
        self(task, service)
    }
}

/// A topic the client fetches tasks for.
#[derive(Clone)]
pub struct TopicSubscription {
    pub topic: String,
    /// Overrides the client's lock duration for this topic.
    pub lock_duration: Option<Duration>,
    handler: Arc<dyn ExternalTaskHandler>,
}

impl fmt::Debug for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSubscription")
            .field("topic", &self.topic)
            .field("lock_duration", &self.lock_duration)
            .finish_non_exhaustive()
    }
}

/// Counters of a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub fetches: u64,
    pub fetch_failures: u64,
    pub tasks_fetched: u64,
    pub tasks_handled: u64,
    pub handler_failures: u64,
}

/// External task worker.
pub struct ExternalTaskClient {
    transport: Arc<dyn ExternalTaskTransport>,
    config: ClientConfig,
    worker_id: String,
    subscriptions: Vec<TopicSubscription>,
    backoff: Box<dyn BackoffStrategy>,
    stats: Arc<Mutex<ClientStats>>,
}

impl ExternalTaskClient {
    pub fn new(
        transport: Arc<dyn ExternalTaskTransport>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            transport,
            worker_id: config.resolved_worker_id(),
            backoff: Box::new(ExponentialBackoff::new(config.backoff_policy())),
            config,
            subscriptions: Vec::new(),
            stats: Arc::default(),
        })
    }

    /// Subscribe `handler` to `topic` with the client's lock duration.
    pub fn subscribe<F>(self, topic: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&LockedExternalTask, &TaskService<'_>) -> Result<(), ClientError>
            + Send
            + Sync
            + 'static,
    {
        self.subscribe_handler(topic, None, Arc::new(handler))
    }

    pub fn subscribe_handler(
        mut self,
        topic: impl Into<String>,
        lock_duration: Option<Duration>,
        handler: Arc<dyn ExternalTaskHandler>,
    ) -> Self {
        self.subscriptions.push(TopicSubscription {
            topic: topic.into(),
            lock_duration,
            handler,
        });
        self
    }

    /// Replace the exponential backoff.
    pub fn with_backoff(mut self, backoff: Box<dyn BackoffStrategy>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn subscriptions(&self) -> &[TopicSubscription] {
        &self.subscriptions
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Wait before the next fetch.
    pub fn backoff_wait(&self) -> Duration {
        self.backoff.wait()
    }

    /// Fetch once, run the handlers of every fetched task and feed the
    /// result to the backoff. Returns how many tasks were fetched.
    pub fn poll_once(&mut self) -> Result<usize, ClientError> {
        self.check_subscriptions()?;
        let request = self.fetch_request();
        let fetched = match self.transport.fetch_and_lock(&request) {
            Ok(tasks) => tasks,
            Err(err) => {
                self.update_stats(|s| {
                    s.fetches += 1;
                    s.fetch_failures += 1;
                });
                self.backoff.reconfigure(0);
                return Err(err.into());
            }
        };
        let count = fetched.len();
        self.update_stats(|s| {
            s.fetches += 1;
            s.tasks_fetched += count as u64;
        });
        if count > 0 {
            debug!(worker_id = %self.worker_id, count, "external tasks fetched");
        }

        for task in &fetched {
            self.handle(task);
        }
        self.backoff.reconfigure(count);
        Ok(count)
    }

    /// Start polling on a dedicated thread.
    pub fn start(mut self) -> Result<ClientHandle, ClientError> {
        self.check_subscriptions()?;
        let (control, rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();
        let worker_id = self.worker_id.clone();
        let join = thread::Builder::new()
            .name(format!("external-task-client-{worker_id}"))
            .spawn(move || self.run(rx))
            .map_err(|e| ClientError::Spawn(e.to_string()))?;
        Ok(ClientHandle {
            worker_id,
            control,
            join: Some(join),
            stats,
        })
    }

    fn run(&mut self, rx: mpsc::Receiver<()>) {
        let topics: Vec<&str> = self.subscriptions.iter().map(|s| s.topic.as_str()).collect();
        info!(worker_id = %self.worker_id, topics = ?topics, "external task client started");
        loop {
            match rx.try_recv() {
                Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
                Err(mpsc::TryRecvError::Empty) => {}
            }
            if let Err(err) = self.poll_once() {
                warn!(worker_id = %self.worker_id, error = %err, "fetching external tasks failed");
            }
            let wait = self.backoff.wait();
            if wait.is_zero() {
                continue;
            }
            match rx.recv_timeout(wait) {
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(worker_id = %self.worker_id, "external task client stopped");
    }

    fn handle(&self, task: &LockedExternalTask) {
        let Some(subscription) = self.subscriptions.iter().find(|s| s.topic == task.topic) else {
            warn!(task_id = %task.id, topic = %task.topic, "no handler for fetched task");
            return;
        };
        let service = TaskService {
            transport: self.transport.as_ref(),
            worker_id: &self.worker_id,
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            subscription.handler.execute(task, &service)
        }))
        .unwrap_or_else(|_| Err(ClientError::handler("handler panicked")));

        match result {
            Ok(()) => self.update_stats(|s| s.tasks_handled += 1),
            Err(err) => {
                error!(task_id = %task.id, topic = %task.topic, error = %err, "external task handler failed");
                self.update_stats(|s| s.handler_failures += 1);
            }
        }
    }

    fn fetch_request(&self) -> FetchRequest {
        let mut request = FetchRequest::new(self.worker_id.clone(), self.config.max_tasks);
        request.use_priority = self.config.use_priority;
        for subscription in &self.subscriptions {
            request = request.topic(
                subscription.topic.clone(),
                subscription
                    .lock_duration
                    .unwrap_or_else(|| self.config.lock_duration()),
            );
        }
        if let Some(timeout) = self.config.async_response_timeout() {
            request = request.long_poll(timeout);
        }
        request
    }

    fn check_subscriptions(&self) -> Result<(), ClientError> {
        if self.subscriptions.is_empty() {
            return Err(ClientError::NoSubscriptions);
        }
        let mut seen = HashSet::new();
        for subscription in &self.subscriptions {
            if !seen.insert(subscription.topic.as_str()) {
                return Err(ClientError::DuplicateSubscription(subscription.topic.clone()));
            }
        }
        Ok(())
    }

    fn update_stats(&self, f: impl FnOnce(&mut ClientStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut stats);
    }
}

impl fmt::Debug for ExternalTaskClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalTaskClient")
            .field("worker_id", &self.worker_id)
            .field("subscriptions", &self.subscriptions)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle to a running client. A long-polling fetch in flight delays the
/// stop by up to the response timeout.
#[derive(Debug)]
pub struct ClientHandle {
    worker_id: String,
    control: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ClientStats>>,
}

impl ClientHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Stop polling and wait for the thread to finish.
    pub fn shutdown(mut self) {
        let _ = self.control.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            let _ = self.control.send(());
        }
    }
}
