//! Job handlers and their registry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use stepflow_core::EngineResult;

use crate::types::Job;

/// Which part of the dispatcher runs a batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum DispatchClass {
    /// Bounded worker pool; batches are rejected when it is full.
    #[default]
    ShortRunning,
    /// Dedicated thread per batch.
    LongRunning,
}

/// What a handler sees while it runs a job.
#[derive(Debug)]
pub struct JobContext<'a> {
    pub job: &'a Job,
    /// Lock owner the job was acquired by; `None` for manual execution.
    pub lock_owner: Option<&'a str>,
    pub now: DateTime<Utc>,
}

/// Performs the work of one handler type.
///
/// `execute` may run more than once for the same job: after an optimistic
/// locking conflict the whole command is re-run from scratch.
pub trait JobHandler: Send + Sync {
    fn handler_type(&self) -> &str;

    fn execute(&self, ctx: &JobContext<'_>) -> EngineResult<()>;

    fn dispatch_class(&self) -> DispatchClass {
        DispatchClass::ShortRunning
    }
}

/// Closure-backed handler, mostly for tests and small integrations.
pub struct FnHandler<F> {
    handler_type: String,
    class: DispatchClass,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&JobContext<'_>) -> EngineResult<()> + Send + Sync,
{
    pub fn new(handler_type: impl Into<String>, f: F) -> Self {
        Self {
            handler_type: handler_type.into(),
            class: DispatchClass::ShortRunning,
            f,
        }
    }

    pub fn long_running(mut self) -> Self {
        self.class = DispatchClass::LongRunning;
        self
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&JobContext<'_>) -> EngineResult<()> + Send + Sync,
{
    fn handler_type(&self) -> &str {
        &self.handler_type
    }

    fn execute(&self, ctx: &JobContext<'_>) -> EngineResult<()> {
        (self.f)(ctx)
    }

    fn dispatch_class(&self) -> DispatchClass {
        self.class
    }
}

/// Handlers of one job source, keyed by handler type.
///
/// Registration goes through `&self` so handlers that need the engine they
/// belong to can be added after it is built.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    long_running: HashSet<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler types forced onto the long-running class, whatever the handler says.
    pub fn with_long_running<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            handlers: RwLock::new(HashMap::new()),
            long_running: types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn register(&self, handler: Arc<dyn JobHandler>) {
        let key = handler.handler_type().to_string();
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        if handlers.insert(key.clone(), handler).is_some() {
            tracing::debug!(handler_type = %key, "replaced job handler");
        }
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        handlers.get(handler_type).cloned()
    }

    pub fn contains(&self, handler_type: &str) -> bool {
        self.get(handler_type).is_some()
    }

    /// Dispatch class for a handler type; unknown types run short.
    pub fn dispatch_class(&self, handler_type: &str) -> DispatchClass {
        if self.long_running.contains(handler_type) {
            return DispatchClass::LongRunning;
        }
        self.get(handler_type)
            .map(|h| h.dispatch_class())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        let mut types: Vec<&String> = handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &types)
            .field("long_running", &self.long_running)
            .finish()
    }
}
