//! Process models: activities, transitions, behaviours and listeners.
//!
//! A model is built in code with [`ProcessModel::builder`] and validated when
//! built. Deploying it binds it to a definition id, version and deployment.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use stepflow_core::EngineError;

use crate::listener::{DelegateExecution, EventName, ExecutionListener, ListenerError};

/// Guard on a transition, evaluated against the variables visible to the execution.
pub type Condition = Arc<dyn Fn(&Map<String, JsonValue>) -> bool + Send + Sync>;

/// What an activity does when executed.
#[derive(Clone)]
pub enum Behavior {
    /// Leave immediately through the first transition whose condition holds.
    Automatic,
    /// Park until the execution is signalled.
    WaitState,
    /// Run a delegate, then leave like `Automatic`.
    ServiceTask(Arc<dyn ExecutionListener>),
    /// Join all incoming concurrent executions, then fork one per outgoing transition.
    ParallelGateway,
    /// End the execution; the last one ends the process instance.
    EndEvent,
    /// Publish an external task on `topic` and park until a worker completes it.
    ExternalTask { topic: String },
}

impl Behavior {
    pub fn service_task<F>(f: F) -> Self
    where
        F: Fn(&mut DelegateExecution<'_>) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        Behavior::ServiceTask(Arc::new(f))
    }

    pub fn external_task(topic: impl Into<String>) -> Self {
        Behavior::ExternalTask {
            topic: topic.into(),
        }
    }

    /// Whether `signal` may resume an execution parked here.
    pub fn is_wait_state(&self) -> bool {
        matches!(self, Behavior::WaitState | Behavior::ExternalTask { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            Behavior::Automatic => "automatic",
            Behavior::WaitState => "wait-state",
            Behavior::ServiceTask(_) => "service-task",
            Behavior::ParallelGateway => "parallel-gateway",
            Behavior::EndEvent => "end-event",
            Behavior::ExternalTask { .. } => "external-task",
        }
    }
}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Behavior::ExternalTask { topic } => write!(f, "ExternalTask({topic})"),
            other => f.write_str(other.name()),
        }
    }
}

type Listeners = BTreeMap<EventName, Vec<Arc<dyn ExecutionListener>>>;

/// A node of the process graph.
#[derive(Clone)]
pub struct Activity {
    pub id: String,
    pub behavior: Behavior,
    pub async_before: bool,
    pub async_after: bool,
    listeners: Listeners,
}

impl Activity {
    pub fn new(id: impl Into<String>, behavior: Behavior) -> Self {
        Self {
            id: id.into(),
            behavior,
            async_before: false,
            async_after: false,
            listeners: Listeners::new(),
        }
    }

    /// Persist and continue in a job before the activity starts.
    pub fn async_before(mut self) -> Self {
        self.async_before = true;
        self
    }

    /// Persist and continue in a job before the activity ends.
    pub fn async_after(mut self) -> Self {
        self.async_after = true;
        self
    }

    pub fn listener<F>(self, event: EventName, listener: F) -> Self
    where
        F: Fn(&mut DelegateExecution<'_>) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.listener_instance(event, Arc::new(listener))
    }

    pub fn listener_instance(mut self, event: EventName, listener: Arc<dyn ExecutionListener>) -> Self {
        self.listeners.entry(event).or_default().push(listener);
        self
    }

    pub fn listeners(&self, event: EventName) -> &[Arc<dyn ExecutionListener>] {
        self.listeners.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("id", &self.id)
            .field("behavior", &self.behavior)
            .field("async_before", &self.async_before)
            .field("async_after", &self.async_after)
            .finish_non_exhaustive()
    }
}

/// A directed edge between two activities.
#[derive(Clone)]
pub struct Transition {
    pub id: String,
    pub source: String,
    pub destination: String,
    condition: Option<Condition>,
    listeners: Vec<Arc<dyn ExecutionListener>>,
}

impl Transition {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            destination: destination.into(),
            condition: None,
            listeners: Vec::new(),
        }
    }

    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Map<String, JsonValue>) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Add a listener for the `take` event.
    pub fn listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&mut DelegateExecution<'_>) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn listeners(&self) -> &[Arc<dyn ExecutionListener>] {
        &self.listeners
    }

    pub fn is_enabled(&self, variables: &Map<String, JsonValue>) -> bool {
        self.condition.as_ref().is_none_or(|c| c(variables))
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("conditional", &self.condition.is_some())
            .finish_non_exhaustive()
    }
}

/// Model validation failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("process key must not be empty")]
    EmptyKey,

    #[error("process '{0}' has no activities")]
    NoActivities(String),

    #[error("duplicate activity id '{0}'")]
    DuplicateActivity(String),

    #[error("duplicate transition id '{0}'")]
    DuplicateTransition(String),

    #[error("transition '{transition}' references unknown activity '{activity}'")]
    UnknownActivity { transition: String, activity: String },

    #[error("initial activity '{0}' does not exist")]
    UnknownInitial(String),

    #[error("activity '{0}' is an end event but has outgoing transitions")]
    EndEventWithOutgoing(String),
}

impl From<ModelError> for EngineError {
    fn from(err: ModelError) -> Self {
        EngineError::validation(err.to_string())
    }
}

/// Validated process graph.
#[derive(Clone)]
pub struct ProcessModel {
    key: String,
    name: Option<String>,
    initial: String,
    activities: HashMap<String, Activity>,
    transitions: HashMap<String, Transition>,
    outgoing: HashMap<String, Vec<String>>,
    incoming_count: HashMap<String, usize>,
    listeners: Listeners,
}

impl ProcessModel {
    pub fn builder(key: impl Into<String>) -> ProcessModelBuilder {
        ProcessModelBuilder::new(key)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn initial(&self) -> &str {
        &self.initial
    }

    pub fn activity(&self, id: &str) -> Option<&Activity> {
        self.activities.get(id)
    }

    pub fn transition(&self, id: &str) -> Option<&Transition> {
        self.transitions.get(id)
    }

    /// Outgoing transitions of an activity, in declaration order.
    pub fn outgoing(&self, activity_id: &str) -> impl Iterator<Item = &Transition> {
        self.outgoing
            .get(activity_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.transitions.get(id))
    }

    pub fn incoming_count(&self, activity_id: &str) -> usize {
        self.incoming_count.get(activity_id).copied().unwrap_or(0)
    }

    /// Process-level listeners (`start` / `end`).
    pub fn listeners(&self, event: EventName) -> &[Arc<dyn ExecutionListener>] {
        self.listeners.get(&event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn activity_count(&self) -> usize {
        self.activities.len()
    }
}

impl fmt::Debug for ProcessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessModel")
            .field("key", &self.key)
            .field("initial", &self.initial)
            .field("activities", &self.activities.len())
            .field("transitions", &self.transitions.len())
            .finish_non_exhaustive()
    }
}

/// Fluent builder for [`ProcessModel`].
pub struct ProcessModelBuilder {
    key: String,
    name: Option<String>,
    initial: Option<String>,
    activities: Vec<Activity>,
    transitions: Vec<Transition>,
    listeners: Listeners,
}

impl ProcessModelBuilder {
    fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            initial: None,
            activities: Vec::new(),
            transitions: Vec::new(),
            listeners: Listeners::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Activity the process starts in. Defaults to the first one added.
    pub fn initial(mut self, activity_id: impl Into<String>) -> Self {
        self.initial = Some(activity_id.into());
        self
    }

    pub fn activity(mut self, activity: Activity) -> Self {
        self.activities.push(activity);
        self
    }

    /// Add an unconditional transition with a generated id.
    pub fn flow(self, source: impl Into<String>, destination: impl Into<String>) -> Self {
        let source = source.into();
        let destination = destination.into();
        let id = format!("{source}->{destination}");
        self.transition(Transition::new(id, source, destination))
    }

    pub fn transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn listener<F>(self, event: EventName, listener: F) -> Self
    where
        F: Fn(&mut DelegateExecution<'_>) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.listener_instance(event, Arc::new(listener))
    }

    pub fn listener_instance(mut self, event: EventName, listener: Arc<dyn ExecutionListener>) -> Self {
        self.listeners.entry(event).or_default().push(listener);
        self
    }

    pub fn build(self) -> Result<ProcessModel, ModelError> {
        if self.key.trim().is_empty() {
            return Err(ModelError::EmptyKey);
        }
        let Some(first) = self.activities.first() else {
            return Err(ModelError::NoActivities(self.key));
        };
        let initial = self.initial.unwrap_or_else(|| first.id.clone());

        let mut activities = HashMap::with_capacity(self.activities.len());
        for activity in self.activities {
            if activities.contains_key(&activity.id) {
                return Err(ModelError::DuplicateActivity(activity.id));
            }
            activities.insert(activity.id.clone(), activity);
        }
        if !activities.contains_key(&initial) {
            return Err(ModelError::UnknownInitial(initial));
        }

        let mut seen = HashSet::new();
        let mut transitions = HashMap::with_capacity(self.transitions.len());
        let mut outgoing: HashMap<String, Vec<String>> = HashMap::new();
        let mut incoming_count: HashMap<String, usize> = HashMap::new();
        for transition in self.transitions {
            if !seen.insert(transition.id.clone()) {
                return Err(ModelError::DuplicateTransition(transition.id));
            }
            for endpoint in [&transition.source, &transition.destination] {
                if !activities.contains_key(endpoint) {
                    return Err(ModelError::UnknownActivity {
                        transition: transition.id.clone(),
                        activity: endpoint.clone(),
                    });
                }
            }
            if matches!(activities[&transition.source].behavior, Behavior::EndEvent) {
                return Err(ModelError::EndEventWithOutgoing(transition.source));
            }
            outgoing
                .entry(transition.source.clone())
                .or_default()
                .push(transition.id.clone());
            *incoming_count
                .entry(transition.destination.clone())
                .or_default() += 1;
            transitions.insert(transition.id.clone(), transition);
        }

        Ok(ProcessModel {
            key: self.key,
            name: self.name,
            initial,
            activities,
            transitions,
            outgoing,
            incoming_count,
            listeners: self.listeners,
        })
    }
}
