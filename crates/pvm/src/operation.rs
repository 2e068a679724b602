//! Atomic operations and the interpreter that performs them.
//!
//! Every advancement of an execution is a sequence of small steps. Each step
//! performs one atomic operation on one execution and schedules the next one
//! onto the interpreter's work queue instead of calling it, so arbitrarily long
//! listener chains and activity graphs run in constant stack depth.
//!
//! Event operations (`process-start`, `activity-start`, `activity-end`,
//! `transition-take`, `process-end`) invoke one listener per step and keep
//! their progress in the execution's `listener_index`. A command that stops
//! mid-chain (step budget, async continuation) resumes with the next listener.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use stepflow_core::{EngineError, EngineResult, ExecutionId};

use crate::execution::{Execution, ProcessInstance};
use crate::listener::{DelegateExecution, EventName, ExecutionListener};
use crate::model::{Activity, Behavior, ProcessModel, Transition};

/// One kind of execution step.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AtomicOperation {
    ProcessStart,
    ActivityStart,
    ActivityExecute,
    ActivityEnd,
    TransitionTake,
    ProcessEnd,
}

impl AtomicOperation {
    pub fn name(&self) -> &'static str {
        match self {
            AtomicOperation::ProcessStart => "process-start",
            AtomicOperation::ActivityStart => "activity-start",
            AtomicOperation::ActivityExecute => "activity-execute",
            AtomicOperation::ActivityEnd => "activity-end",
            AtomicOperation::TransitionTake => "transition-take",
            AtomicOperation::ProcessEnd => "process-end",
        }
    }

    /// Listener event dispatched by this operation, if any.
    pub fn event(&self) -> Option<EventName> {
        match self {
            AtomicOperation::ProcessStart | AtomicOperation::ActivityStart => Some(EventName::Start),
            AtomicOperation::ActivityEnd | AtomicOperation::ProcessEnd => Some(EventName::End),
            AtomicOperation::TransitionTake => Some(EventName::Take),
            AtomicOperation::ActivityExecute => None,
        }
    }
}

impl fmt::Display for AtomicOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AtomicOperation {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            AtomicOperation::ProcessStart,
            AtomicOperation::ActivityStart,
            AtomicOperation::ActivityExecute,
            AtomicOperation::ActivityEnd,
            AtomicOperation::TransitionTake,
            AtomicOperation::ProcessEnd,
        ]
        .into_iter()
        .find(|op| op.name() == s)
        .ok_or_else(|| EngineError::validation(format!("unknown atomic operation '{s}'")))
    }
}

/// An operation scheduled on an execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub operation: AtomicOperation,
    pub execution_id: ExecutionId,
    /// The async boundary of this step was already crossed.
    #[serde(default)]
    pub skip_async: bool,
}

impl Step {
    pub fn new(operation: AtomicOperation, execution_id: ExecutionId) -> Self {
        Self {
            operation,
            execution_id,
            skip_async: false,
        }
    }

    fn resumed(self) -> Self {
        Self {
            skip_async: true,
            ..self
        }
    }
}

/// Side effect the caller must apply once the instance is saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deferred {
    /// Continue with this step in an async-continuation job.
    Continuation(Step),
    /// Publish an external task for an execution parked at `activity_id`.
    ExternalTask {
        execution_id: ExecutionId,
        activity_id: String,
        topic: String,
    },
}

/// Result of running the interpreter to quiescence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub steps: usize,
    /// The process instance ended.
    pub ended: bool,
    pub deferred: Vec<Deferred>,
}

impl RunOutcome {
    pub fn continuations(&self) -> impl Iterator<Item = &Step> {
        self.deferred.iter().filter_map(|d| match d {
            Deferred::Continuation(step) => Some(step),
            Deferred::ExternalTask { .. } => None,
        })
    }
}

enum Started {
    Continue(ExecutionId),
    Park,
}

/// Trampoline over the atomic operations of one process instance.
pub struct Interpreter<'m> {
    model: &'m ProcessModel,
    step_budget: usize,
    queue: VecDeque<Step>,
    deferred: Vec<Deferred>,
    steps: usize,
    ended: bool,
}

impl<'m> Interpreter<'m> {
    /// After `step_budget` steps the remaining work is handed back as continuations.
    pub fn new(model: &'m ProcessModel, step_budget: usize) -> Self {
        Self {
            model,
            step_budget: step_budget.max(1),
            queue: VecDeque::new(),
            deferred: Vec::new(),
            steps: 0,
            ended: false,
        }
    }

    /// Schedule a step. It runs after every step already queued.
    pub fn perform_operation(&mut self, step: Step) {
        self.queue.push_back(step);
    }

    /// Leave the activity of a parked execution through its first enabled transition.
    pub fn leave(&mut self, instance: &mut ProcessInstance, execution_id: ExecutionId) -> EngineResult<()> {
        let model = self.model;
        let activity = self.activity_of(instance, execution_id)?;
        require_mut(instance, execution_id)?.is_waiting = false;
        let variables = instance.variables(execution_id);
        let mut outgoing = model.outgoing(&activity.id).peekable();
        if outgoing.peek().is_none() {
            return self.end_activity(instance, execution_id);
        }
        let Some(transition) = outgoing.find(|t| t.is_enabled(&variables)) else {
            return Err(EngineError::failure(format!(
                "no outgoing transition of activity '{}' is enabled",
                activity.id
            )));
        };
        self.take(instance, execution_id, transition)
    }

    /// Run queued steps until none are left, the process ends or the budget is spent.
    pub fn run(mut self, instance: &mut ProcessInstance) -> EngineResult<RunOutcome> {
        while let Some(step) = self.queue.pop_front() {
            if self.ended {
                break;
            }
            if self.steps >= self.step_budget {
                self.queue.push_front(step);
                debug!(
                    process_instance_id = %instance.id,
                    steps = self.steps,
                    remaining = self.queue.len(),
                    "step budget spent, yielding to async continuations"
                );
                self.deferred
                    .extend(self.queue.drain(..).map(Deferred::Continuation));
                break;
            }
            self.steps += 1;
            trace!(
                operation = %step.operation,
                execution_id = %step.execution_id,
                "performing atomic operation"
            );
            self.perform(instance, step)?;
        }

        Ok(RunOutcome {
            steps: self.steps,
            ended: self.ended,
            deferred: self.deferred,
        })
    }

    fn perform(&mut self, instance: &mut ProcessInstance, step: Step) -> EngineResult<()> {
        match step.operation.event() {
            Some(event) => self.perform_event(instance, step, event),
            None => self.execute_activity(instance, step.execution_id),
        }
    }

    fn perform_event(
        &mut self,
        instance: &mut ProcessInstance,
        step: Step,
        event: EventName,
    ) -> EngineResult<()> {
        let mut execution_id = step.execution_id;
        if require(instance, execution_id)?.listener_index == 0 {
            match self.event_started(instance, step)? {
                Started::Park => return Ok(()),
                Started::Continue(substitute) => execution_id = substitute,
            }
        }

        let (source, listeners) = self.listeners_for(instance, execution_id, step.operation, event)?;
        let index = {
            let execution = require_mut(instance, execution_id)?;
            execution.event_name = Some(event);
            execution.event_source = Some(source.clone());
            execution.listener_index
        };

        if let Some(listener) = listeners.get(index) {
            {
                let mut delegate =
                    DelegateExecution::new(instance, execution_id, Some(event), Some(source));
                listener.notify(&mut delegate)?;
            }
            require_mut(instance, execution_id)?.listener_index += 1;
            self.perform_operation(Step {
                operation: step.operation,
                execution_id,
                skip_async: true,
            });
            Ok(())
        } else {
            require_mut(instance, execution_id)?.clear_event();
            self.event_completed(instance, step.operation, execution_id)
        }
    }

    /// Runs before the first listener. Must be idempotent.
    fn event_started(&mut self, instance: &ProcessInstance, step: Step) -> EngineResult<Started> {
        let id = step.execution_id;
        let park_async = match step.operation {
            AtomicOperation::ActivityStart => self.activity_of(instance, id)?.async_before,
            AtomicOperation::ActivityEnd => self.activity_of(instance, id)?.async_after,
            AtomicOperation::ProcessEnd => {
                return Ok(Started::Continue(instance.root_execution_id()));
            }
            _ => false,
        };
        if park_async && !step.skip_async {
            debug!(
                operation = %step.operation,
                execution_id = %id,
                "async continuation, parking execution"
            );
            self.deferred.push(Deferred::Continuation(step.resumed()));
            return Ok(Started::Park);
        }
        Ok(Started::Continue(id))
    }

    fn event_completed(
        &mut self,
        instance: &mut ProcessInstance,
        operation: AtomicOperation,
        execution_id: ExecutionId,
    ) -> EngineResult<()> {
        match operation {
            AtomicOperation::ProcessStart => {
                require_mut(instance, execution_id)?.activity_id =
                    Some(self.model.initial().to_string());
                self.perform_operation(Step::new(AtomicOperation::ActivityStart, execution_id));
            }
            AtomicOperation::ActivityStart => {
                self.perform_operation(Step::new(AtomicOperation::ActivityExecute, execution_id));
            }
            AtomicOperation::ActivityEnd => {
                if require(instance, execution_id)?.transition_id.is_some() {
                    self.perform_operation(Step::new(AtomicOperation::TransitionTake, execution_id));
                } else {
                    self.end_execution(instance, execution_id)?;
                }
            }
            AtomicOperation::TransitionTake => {
                let destination = self.transition_of(instance, execution_id)?.destination.clone();
                let execution = require_mut(instance, execution_id)?;
                execution.activity_id = Some(destination);
                execution.transition_id = None;
                self.perform_operation(Step::new(AtomicOperation::ActivityStart, execution_id));
            }
            AtomicOperation::ProcessEnd => {
                instance.end();
                self.ended = true;
                info!(process_instance_id = %instance.id, "process instance ended");
            }
            AtomicOperation::ActivityExecute => {
                return Err(EngineError::invariant("activity-execute has no listener event"));
            }
        }
        Ok(())
    }

    fn execute_activity(
        &mut self,
        instance: &mut ProcessInstance,
        execution_id: ExecutionId,
    ) -> EngineResult<()> {
        let activity = self.activity_of(instance, execution_id)?;
        match &activity.behavior {
            Behavior::Automatic => self.leave(instance, execution_id),
            Behavior::ServiceTask(delegate) => {
                {
                    let mut execution =
                        DelegateExecution::new(instance, execution_id, None, Some(activity.id.clone()));
                    delegate.notify(&mut execution)?;
                }
                self.leave(instance, execution_id)
            }
            Behavior::WaitState => {
                require_mut(instance, execution_id)?.is_waiting = true;
                debug!(execution_id = %execution_id, activity_id = %activity.id, "execution waiting");
                Ok(())
            }
            Behavior::ExternalTask { topic } => {
                require_mut(instance, execution_id)?.is_waiting = true;
                self.deferred.push(Deferred::ExternalTask {
                    execution_id,
                    activity_id: activity.id.clone(),
                    topic: topic.clone(),
                });
                Ok(())
            }
            Behavior::EndEvent => self.end_activity(instance, execution_id),
            Behavior::ParallelGateway => self.parallel_gateway(instance, execution_id, activity),
        }
    }

    fn parallel_gateway(
        &mut self,
        instance: &mut ProcessInstance,
        execution_id: ExecutionId,
        gateway: &'m Activity,
    ) -> EngineResult<()> {
        let mut scope_id = execution_id;
        let execution = require(instance, execution_id)?;
        let incoming = self.model.incoming_count(&gateway.id);

        if execution.is_concurrent && incoming > 1 {
            let parent = execution.parent_id.ok_or_else(|| {
                EngineError::invariant(format!("concurrent execution {execution_id} has no parent"))
            })?;
            require_mut(instance, execution_id)?.is_active = false;
            let arrived: Vec<ExecutionId> = instance
                .children(parent)
                .filter(|c| {
                    c.is_concurrent
                        && !c.is_active
                        && !c.is_ended
                        && c.activity_id.as_deref() == Some(gateway.id.as_str())
                })
                .map(|c| c.id)
                .collect();
            if arrived.len() < incoming {
                debug!(
                    activity_id = %gateway.id,
                    arrived = arrived.len(),
                    incoming,
                    "waiting at join"
                );
                return Ok(());
            }
            for joined in arrived {
                instance.remove_execution(joined);
            }
            let scope = require_mut(instance, parent)?;
            scope.activity_id = Some(gateway.id.clone());
            scope.is_active = true;
            scope_id = parent;
        }

        let outgoing: Vec<&'m Transition> = self.model.outgoing(&gateway.id).collect();
        match outgoing.as_slice() {
            [] => self.end_activity(instance, scope_id),
            [single] => self.take(instance, scope_id, single),
            branches => {
                let execution = require(instance, scope_id)?;
                let (parent, reuse) = if execution.is_concurrent {
                    let parent = execution.parent_id.ok_or_else(|| {
                        EngineError::invariant(format!("concurrent execution {scope_id} has no parent"))
                    })?;
                    (parent, Some(scope_id))
                } else {
                    require_mut(instance, scope_id)?.is_active = false;
                    (scope_id, None)
                };
                for (i, transition) in branches.iter().enumerate() {
                    let branch = match (i, reuse) {
                        (0, Some(reused)) => reused,
                        _ => instance.create_concurrent_child(parent, Some(gateway.id.clone())),
                    };
                    self.take(instance, branch, transition)?;
                }
                debug!(activity_id = %gateway.id, branches = branches.len(), "forked");
                Ok(())
            }
        }
    }

    fn take(
        &mut self,
        instance: &mut ProcessInstance,
        execution_id: ExecutionId,
        transition: &Transition,
    ) -> EngineResult<()> {
        require_mut(instance, execution_id)?.transition_id = Some(transition.id.clone());
        self.perform_operation(Step::new(AtomicOperation::ActivityEnd, execution_id));
        Ok(())
    }

    /// End the current activity without taking a transition.
    fn end_activity(&mut self, instance: &mut ProcessInstance, execution_id: ExecutionId) -> EngineResult<()> {
        require_mut(instance, execution_id)?.transition_id = None;
        self.perform_operation(Step::new(AtomicOperation::ActivityEnd, execution_id));
        Ok(())
    }

    fn end_execution(&mut self, instance: &mut ProcessInstance, execution_id: ExecutionId) -> EngineResult<()> {
        match require(instance, execution_id)?.parent_id {
            None => {
                self.perform_operation(Step::new(AtomicOperation::ProcessEnd, execution_id));
            }
            Some(parent) => {
                instance.remove_execution(execution_id);
                if instance.children(parent).next().is_none() {
                    self.perform_operation(Step::new(AtomicOperation::ProcessEnd, parent));
                }
            }
        }
        Ok(())
    }

    fn listeners_for(
        &self,
        instance: &ProcessInstance,
        execution_id: ExecutionId,
        operation: AtomicOperation,
        event: EventName,
    ) -> EngineResult<(String, &'m [Arc<dyn ExecutionListener>])> {
        match operation {
            AtomicOperation::ProcessStart | AtomicOperation::ProcessEnd => {
                Ok((self.model.key().to_string(), self.model.listeners(event)))
            }
            AtomicOperation::ActivityStart | AtomicOperation::ActivityEnd => {
                let activity = self.activity_of(instance, execution_id)?;
                Ok((activity.id.clone(), activity.listeners(event)))
            }
            AtomicOperation::TransitionTake => {
                let transition = self.transition_of(instance, execution_id)?;
                Ok((transition.id.clone(), transition.listeners()))
            }
            AtomicOperation::ActivityExecute => {
                Err(EngineError::invariant("activity-execute has no listener event"))
            }
        }
    }

    fn activity_of(&self, instance: &ProcessInstance, execution_id: ExecutionId) -> EngineResult<&'m Activity> {
        let activity_id = require(instance, execution_id)?
            .activity_id
            .as_deref()
            .ok_or_else(|| {
                EngineError::invariant(format!("execution {execution_id} is not at an activity"))
            })?;
        self.model.activity(activity_id).ok_or_else(|| {
            EngineError::invariant(format!(
                "activity '{activity_id}' is not part of process '{}'",
                self.model.key()
            ))
        })
    }

    fn transition_of(&self, instance: &ProcessInstance, execution_id: ExecutionId) -> EngineResult<&'m Transition> {
        let transition_id = require(instance, execution_id)?
            .transition_id
            .as_deref()
            .ok_or_else(|| {
                EngineError::invariant(format!("execution {execution_id} is not taking a transition"))
            })?;
        self.model.transition(transition_id).ok_or_else(|| {
            EngineError::invariant(format!(
                "transition '{transition_id}' is not part of process '{}'",
                self.model.key()
            ))
        })
    }
}

fn require(instance: &ProcessInstance, id: ExecutionId) -> EngineResult<&Execution> {
    instance
        .execution(id)
        .ok_or_else(|| EngineError::invariant(format!("execution {id} does not exist")))
}

fn require_mut(instance: &mut ProcessInstance, id: ExecutionId) -> EngineResult<&mut Execution> {
    instance
        .execution_mut(id)
        .ok_or_else(|| EngineError::invariant(format!("execution {id} does not exist")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;
    use serde_json::{Map, json};
    use stepflow_core::{DeploymentId, ProcessDefinitionId, ProcessInstanceId};

    use crate::listener::ListenerError;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, name: &str) -> impl Fn(&mut DelegateExecution<'_>) -> Result<(), ListenerError> + Send + Sync + 'static {
        let log = log.clone();
        let name = name.to_string();
        move |_| {
            log.lock().unwrap().push(name.clone());
            Ok(())
        }
    }

    fn instance() -> ProcessInstance {
        ProcessInstance::new(
            ProcessInstanceId::new(),
            ProcessDefinitionId::from_u128(1),
            "test",
            DeploymentId::from_u128(1),
            Map::new(),
            Utc::now(),
        )
    }

    fn start(model: &ProcessModel, instance: &mut ProcessInstance, budget: usize) -> RunOutcome {
        let mut interpreter = Interpreter::new(model, budget);
        interpreter.perform_operation(Step::new(AtomicOperation::ProcessStart, instance.root_execution_id()));
        interpreter.run(instance).unwrap()
    }

    fn resume(model: &ProcessModel, instance: &mut ProcessInstance, steps: Vec<Step>, budget: usize) -> RunOutcome {
        let mut interpreter = Interpreter::new(model, budget);
        for step in steps {
            interpreter.perform_operation(step);
        }
        interpreter.run(instance).unwrap()
    }

    #[test]
    fn operation_names_round_trip() {
        for op in [
            AtomicOperation::ProcessStart,
            AtomicOperation::ActivityStart,
            AtomicOperation::ActivityExecute,
            AtomicOperation::ActivityEnd,
            AtomicOperation::TransitionTake,
            AtomicOperation::ProcessEnd,
        ] {
            assert_eq!(op.name().parse::<AtomicOperation>().unwrap(), op);
            assert_eq!(serde_json::to_value(op).unwrap(), json!(op.name()));
        }
        assert!("fire-event".parse::<AtomicOperation>().is_err());
    }

    #[test]
    fn listeners_fire_in_lifecycle_order() {
        let log: Log = Arc::default();
        let model = ProcessModel::builder("p")
            .listener(EventName::Start, recorder(&log, "process:start"))
            .listener(EventName::End, recorder(&log, "process:end"))
            .activity(
                Activity::new("task", Behavior::service_task(recorder(&log, "task:execute")))
                    .listener(EventName::Start, recorder(&log, "task:start"))
                    .listener(EventName::End, recorder(&log, "task:end")),
            )
            .activity(Activity::new("end", Behavior::EndEvent).listener(EventName::Start, recorder(&log, "end:start")))
            .transition(Transition::new("flow", "task", "end").listener(recorder(&log, "flow:take")))
            .build()
            .unwrap();

        let mut instance = instance();
        let outcome = start(&model, &mut instance, usize::MAX);

        assert!(outcome.ended);
        assert!(instance.ended);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "process:start",
                "task:start",
                "task:execute",
                "task:end",
                "flow:take",
                "end:start",
                "process:end",
            ]
        );
    }

    #[test]
    fn interrupted_listener_chain_resumes_at_next_listener() {
        let log: Log = Arc::default();
        let model = ProcessModel::builder("p")
            .activity(Activity::new("start", Behavior::Automatic))
            .activity(
                Activity::new("task", Behavior::Automatic)
                    .listener(EventName::Start, recorder(&log, "l1"))
                    .listener(EventName::Start, recorder(&log, "l2"))
                    .listener(EventName::Start, recorder(&log, "l3")),
            )
            .activity(Activity::new("end", Behavior::EndEvent))
            .flow("start", "task")
            .flow("task", "end")
            .build()
            .unwrap();

        // process-start, activity-start, activity-execute, activity-end,
        // transition-take, then the first listener of task.
        let mut instance = instance();
        let outcome = start(&model, &mut instance, 6);

        assert!(!outcome.ended);
        assert_eq!(*log.lock().unwrap(), vec!["l1"]);
        let root = instance.root().unwrap();
        assert_eq!(root.activity_id.as_deref(), Some("task"));
        assert_eq!(root.listener_index, 1);
        assert_eq!(root.event_name, Some(EventName::Start));
        let pending: Vec<Step> = outcome.continuations().copied().collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, AtomicOperation::ActivityStart);

        let resumed = resume(&model, &mut instance, pending, usize::MAX);
        assert!(resumed.ended);
        assert_eq!(*log.lock().unwrap(), vec!["l1", "l2", "l3"]);
    }

    #[test]
    fn failing_listener_surfaces_and_keeps_index() {
        let model = ProcessModel::builder("p")
            .activity(
                Activity::new("task", Behavior::WaitState)
                    .listener(EventName::Start, |_: &mut DelegateExecution<'_>| Ok(()))
                    .listener(EventName::Start, |_: &mut DelegateExecution<'_>| {
                        Err(ListenerError::fault("credit check rejected"))
                    }),
            )
            .build()
            .unwrap();

        let mut instance = instance();
        let mut interpreter = Interpreter::new(&model, usize::MAX);
        interpreter.perform_operation(Step::new(AtomicOperation::ProcessStart, instance.root_execution_id()));
        let err = interpreter.run(&mut instance).unwrap_err();
        assert_eq!(err, EngineError::fault("credit check rejected"));
        assert_eq!(instance.root().unwrap().listener_index, 1);
    }

    #[test]
    fn long_automatic_chain_runs_without_recursion() {
        let mut builder = ProcessModel::builder("chain");
        let length = 20_000;
        for i in 0..length {
            builder = builder.activity(Activity::new(format!("a{i}"), Behavior::Automatic));
            if i > 0 {
                builder = builder.flow(format!("a{}", i - 1), format!("a{i}"));
            }
        }
        let model = builder.build().unwrap();

        let mut instance = instance();
        let outcome = start(&model, &mut instance, usize::MAX);
        assert!(outcome.ended);
        assert!(outcome.steps > 4 * length);
    }

    #[test]
    fn cyclic_graph_yields_when_budget_is_spent() {
        let model = ProcessModel::builder("loop")
            .activity(Activity::new("a", Behavior::Automatic))
            .activity(Activity::new("b", Behavior::Automatic))
            .flow("a", "b")
            .flow("b", "a")
            .build()
            .unwrap();

        let mut instance = instance();
        let first = start(&model, &mut instance, 100);
        assert!(!first.ended);
        assert_eq!(first.steps, 100);
        let pending: Vec<Step> = first.continuations().copied().collect();
        assert_eq!(pending.len(), 1);

        let second = resume(&model, &mut instance, pending, 100);
        assert_eq!(second.steps, 100);
        assert_eq!(second.continuations().count(), 1);
    }

    #[test]
    fn async_before_parks_until_resumed() {
        let log: Log = Arc::default();
        let model = ProcessModel::builder("p")
            .activity(Activity::new("start", Behavior::Automatic))
            .activity(
                Activity::new("task", Behavior::service_task(recorder(&log, "work")))
                    .async_before()
                    .listener(EventName::Start, recorder(&log, "task:start")),
            )
            .activity(Activity::new("end", Behavior::EndEvent))
            .flow("start", "task")
            .flow("task", "end")
            .build()
            .unwrap();

        let mut instance = instance();
        let outcome = start(&model, &mut instance, usize::MAX);
        assert!(!outcome.ended);
        assert!(log.lock().unwrap().is_empty());
        let pending: Vec<Step> = outcome.continuations().copied().collect();
        assert_eq!(
            pending,
            vec![Step {
                operation: AtomicOperation::ActivityStart,
                execution_id: instance.root_execution_id(),
                skip_async: true,
            }]
        );

        let resumed = resume(&model, &mut instance, pending, usize::MAX);
        assert!(resumed.ended);
        assert_eq!(*log.lock().unwrap(), vec!["task:start", "work"]);
    }

    #[test]
    fn async_after_parks_before_end_listeners() {
        let log: Log = Arc::default();
        let model = ProcessModel::builder("p")
            .activity(
                Activity::new("task", Behavior::Automatic)
                    .async_after()
                    .listener(EventName::End, recorder(&log, "task:end")),
            )
            .activity(Activity::new("end", Behavior::EndEvent))
            .flow("task", "end")
            .build()
            .unwrap();

        let mut instance = instance();
        let outcome = start(&model, &mut instance, usize::MAX);
        let pending: Vec<Step> = outcome.continuations().copied().collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, AtomicOperation::ActivityEnd);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(instance.root().unwrap().transition_id.as_deref(), Some("task->end"));

        assert!(resume(&model, &mut instance, pending, usize::MAX).ended);
        assert_eq!(*log.lock().unwrap(), vec!["task:end"]);
    }

    #[test]
    fn parallel_fork_and_join() {
        let model = ProcessModel::builder("p")
            .activity(Activity::new("fork", Behavior::ParallelGateway))
            .activity(Activity::new("a", Behavior::WaitState))
            .activity(Activity::new("b", Behavior::WaitState))
            .activity(Activity::new("join", Behavior::ParallelGateway))
            .activity(Activity::new("after", Behavior::WaitState))
            .flow("fork", "a")
            .flow("fork", "b")
            .flow("a", "join")
            .flow("b", "join")
            .flow("join", "after")
            .build()
            .unwrap();

        let mut instance = instance();
        start(&model, &mut instance, usize::MAX);
        let mut waiting = instance.active_activity_ids();
        waiting.sort();
        assert_eq!(waiting, vec!["a", "b"]);
        let root = instance.root().unwrap();
        assert!(!root.is_active);
        let branches: Vec<ExecutionId> = instance
            .children(root.id)
            .map(|c| c.id)
            .collect();
        assert_eq!(branches.len(), 2);
        assert!(instance.children(root.id).all(|c| c.is_concurrent));

        let mut interpreter = Interpreter::new(&model, usize::MAX);
        interpreter.leave(&mut instance, branches[0]).unwrap();
        interpreter.run(&mut instance).unwrap();
        assert_eq!(instance.executions.len(), 3);
        assert_eq!(instance.active_activity_ids().len(), 1);

        let mut interpreter = Interpreter::new(&model, usize::MAX);
        interpreter.leave(&mut instance, branches[1]).unwrap();
        interpreter.run(&mut instance).unwrap();
        assert_eq!(instance.executions.len(), 1);
        let root = instance.root().unwrap();
        assert!(root.is_active);
        assert_eq!(root.activity_id.as_deref(), Some("after"));
    }

    #[test]
    fn conditions_pick_the_first_enabled_transition() {
        let model = ProcessModel::builder("p")
            .activity(Activity::new("check", Behavior::Automatic))
            .activity(Activity::new("approved", Behavior::WaitState))
            .activity(Activity::new("rejected", Behavior::WaitState))
            .transition(
                Transition::new("yes", "check", "approved")
                    .when(|vars| vars.get("amount").and_then(|v| v.as_i64()).unwrap_or(0) < 1000),
            )
            .transition(Transition::new("no", "check", "rejected"))
            .build()
            .unwrap();

        let mut small = instance();
        small.set_variable(small.root_execution_id(), "amount".into(), json!(10));
        start(&model, &mut small, usize::MAX);
        assert_eq!(small.active_activity_ids(), vec!["approved"]);

        let mut large = instance();
        large.set_variable(large.root_execution_id(), "amount".into(), json!(5000));
        start(&model, &mut large, usize::MAX);
        assert_eq!(large.active_activity_ids(), vec!["rejected"]);
    }

    #[test]
    fn external_task_activity_defers_task_creation() {
        let model = ProcessModel::builder("p")
            .activity(Activity::new("charge", Behavior::external_task("payments")))
            .build()
            .unwrap();
        let mut instance = instance();
        let outcome = start(&model, &mut instance, usize::MAX);
        assert_eq!(
            outcome.deferred,
            vec![Deferred::ExternalTask {
                execution_id: instance.root_execution_id(),
                activity_id: "charge".into(),
                topic: "payments".into(),
            }]
        );
        assert!(!outcome.ended);
    }
}
