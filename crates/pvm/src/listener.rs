//! Execution listeners and the view they get of the running execution.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use stepflow_core::{EngineError, ExecutionId, ProcessInstanceId};

use crate::execution::ProcessInstance;

/// Lifecycle event a listener subscribes to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventName {
    Start,
    End,
    Take,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Start => "start",
            EventName::End => "end",
            EventName::Take => "take",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(EventName::Start),
            "end" => Ok(EventName::End),
            "take" => Ok(EventName::Take),
            other => Err(EngineError::validation(format!("unknown event name '{other}'"))),
        }
    }
}

/// Failure raised by a listener or delegate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// Expected, domain-level fault.
    #[error("{0}")]
    Fault(String),

    /// Unexpected failure.
    #[error("{0}")]
    Failure(String),
}

impl ListenerError {
    pub fn fault(msg: impl Into<String>) -> Self {
        Self::Fault(msg.into())
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self::Failure(msg.into())
    }
}

impl From<ListenerError> for EngineError {
    fn from(err: ListenerError) -> Self {
        match err {
            ListenerError::Fault(msg) => EngineError::Fault(msg),
            ListenerError::Failure(msg) => EngineError::Failure(msg),
        }
    }
}

/// Code run on an execution event, or as the body of a service task.
///
/// Listeners may run again for the same event if the enclosing command is
/// retried after a conflict, so their side effects must tolerate that.
pub trait ExecutionListener: Send + Sync {
    fn notify(&self, execution: &mut DelegateExecution<'_>) -> Result<(), ListenerError>;
}

impl<F> ExecutionListener for F
where
    F: Fn(&mut DelegateExecution<'_>) -> Result<(), ListenerError> + Send + Sync,
{
    fn notify(&self, execution: &mut DelegateExecution<'_>) -> Result<(), ListenerError> {
        self(execution)
    }
}

/// Mutable view of one execution handed to listeners, delegates and conditions.
pub struct DelegateExecution<'a> {
    instance: &'a mut ProcessInstance,
    execution_id: ExecutionId,
    event: Option<EventName>,
    event_source: Option<String>,
}

impl<'a> DelegateExecution<'a> {
    pub(crate) fn new(
        instance: &'a mut ProcessInstance,
        execution_id: ExecutionId,
        event: Option<EventName>,
        event_source: Option<String>,
    ) -> Self {
        Self {
            instance,
            execution_id,
            event,
            event_source,
        }
    }

    pub fn id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn process_instance_id(&self) -> ProcessInstanceId {
        self.instance.id
    }

    pub fn business_key(&self) -> Option<&str> {
        self.instance.business_key.as_deref()
    }

    pub fn activity_id(&self) -> Option<&str> {
        self.instance
            .execution(self.execution_id)
            .and_then(|e| e.activity_id.as_deref())
    }

    pub fn event_name(&self) -> Option<EventName> {
        self.event
    }

    /// Activity, transition or process key that fired the event.
    pub fn event_source(&self) -> Option<&str> {
        self.event_source.as_deref()
    }

    /// Look a variable up on this execution, then on its ancestors.
    pub fn variable(&self, name: &str) -> Option<&JsonValue> {
        self.instance.variable(self.execution_id, name)
    }

    pub fn variables(&self) -> Map<String, JsonValue> {
        self.instance.variables(self.execution_id)
    }

    /// Overwrite the variable where it is defined, or create it on the process instance.
    pub fn set_variable(&mut self, name: impl Into<String>, value: JsonValue) {
        self.instance.set_variable(self.execution_id, name.into(), value);
    }

    pub fn set_variable_local(&mut self, name: impl Into<String>, value: JsonValue) {
        self.instance
            .set_variable_local(self.execution_id, name.into(), value);
    }
}

impl fmt::Debug for DelegateExecution<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateExecution")
            .field("execution_id", &self.execution_id)
            .field("process_instance_id", &self.instance.id)
            .field("event", &self.event)
            .field("event_source", &self.event_source)
            .finish()
    }
}
