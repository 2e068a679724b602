//! Runtime service: deployments, process instances and their advancement.
//!
//! Every public operation that moves a process instance runs inside the job
//! source's command envelope. The interpreter works on a freshly read copy of
//! the instance, the copy is saved conditionally on its revision and only then
//! are the deferred side effects (continuation jobs, external tasks) applied.
//! A conflicting writer therefore makes the whole command re-run without
//! leaving jobs behind for state that was never persisted.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info};

use stepflow_core::{
    Clock, DeploymentId, EngineError, EngineResult, ExecutionId, ProcessDefinitionId,
    ProcessInstanceId,
};
use stepflow_jobs::{DeploymentRegistry, ExternalTaskService, JobService, NewExternalTask, NewJob};

use crate::config::RuntimeConfig;
use crate::continuation::{ASYNC_CONTINUATION, AsyncContinuationHandler, ExternalTaskBridge};
use crate::execution::{Execution, ProcessInstance};
use crate::model::ProcessModel;
use crate::operation::{AtomicOperation, Deferred, Interpreter, RunOutcome, Step};
use crate::store::ProcessStore;

/// A deployed, versioned process model.
#[derive(Debug)]
pub struct ProcessDefinition {
    pub id: ProcessDefinitionId,
    pub key: String,
    /// Starts at 1 and grows with every deployment of the same key.
    pub version: u32,
    pub deployment_id: DeploymentId,
    pub model: Arc<ProcessModel>,
}

#[derive(Debug, Default)]
struct Definitions {
    by_id: HashMap<ProcessDefinitionId, Arc<ProcessDefinition>>,
    by_deployment: HashMap<DeploymentId, Vec<ProcessDefinitionId>>,
    versions: HashMap<String, u32>,
}

impl Definitions {
    fn latest(&self, key: &str) -> Option<&Arc<ProcessDefinition>> {
        self.by_id
            .values()
            .filter(|d| d.key == key)
            .max_by_key(|d| d.version)
    }
}

/// Entry point for deploying models and driving process instances.
pub struct RuntimeService {
    definitions: RwLock<Definitions>,
    store: Arc<dyn ProcessStore>,
    jobs: Arc<JobService>,
    external_tasks: Arc<ExternalTaskService>,
    deployments: Arc<DeploymentRegistry>,
    clock: Arc<dyn Clock>,
    config: RuntimeConfig,
}

impl RuntimeService {
    /// Create the runtime and hook it into the job source and the external
    /// task service: the async-continuation handler is registered on `jobs`
    /// and task completions resume the waiting execution.
    pub fn new(
        store: Arc<dyn ProcessStore>,
        jobs: Arc<JobService>,
        external_tasks: Arc<ExternalTaskService>,
        deployments: Arc<DeploymentRegistry>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        let clock = jobs.clock().clone();
        let runtime = Arc::new(Self {
            definitions: RwLock::new(Definitions::default()),
            store,
            jobs: jobs.clone(),
            external_tasks: external_tasks.clone(),
            deployments,
            clock,
            config,
        });
        jobs.register_handler(Arc::new(AsyncContinuationHandler::new(Arc::downgrade(
            &runtime,
        ))));
        external_tasks.set_completion_handler(Arc::new(ExternalTaskBridge::new(Arc::downgrade(
            &runtime,
        ))));
        runtime
    }

    pub fn jobs(&self) -> &Arc<JobService> {
        &self.jobs
    }

    pub fn external_tasks(&self) -> &Arc<ExternalTaskService> {
        &self.external_tasks
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // -- deployments --------------------------------------------------------

    /// Deploy models as one deployment. Each model becomes the next version of
    /// its key; the deployment is installed so its jobs become runnable.
    pub fn deploy(&self, models: Vec<ProcessModel>) -> EngineResult<DeploymentId> {
        if models.is_empty() {
            return Err(EngineError::validation("a deployment needs at least one model"));
        }
        let mut keys = std::collections::HashSet::new();
        for model in &models {
            if !keys.insert(model.key().to_string()) {
                return Err(EngineError::validation(format!(
                    "process key '{}' appears twice in one deployment",
                    model.key()
                )));
            }
        }

        let deployment_id = DeploymentId::new();
        let mut definitions = self.write_definitions();
        let mut ids = Vec::with_capacity(models.len());
        for model in models {
            let key = model.key().to_string();
            let version = definitions.versions.get(&key).copied().unwrap_or(0) + 1;
            definitions.versions.insert(key.clone(), version);
            let definition = ProcessDefinition {
                id: ProcessDefinitionId::new(),
                key,
                version,
                deployment_id,
                model: Arc::new(model),
            };
            info!(
                process_definition_id = %definition.id,
                key = %definition.key,
                version,
                deployment_id = %deployment_id,
                "process definition deployed"
            );
            ids.push(definition.id);
            definitions.by_id.insert(definition.id, Arc::new(definition));
        }
        definitions.by_deployment.insert(deployment_id, ids);
        drop(definitions);

        self.deployments.install(deployment_id);
        Ok(deployment_id)
    }

    /// Remove a deployment. Without `cascade` it must have no running process
    /// instances; with it they are deleted along with their jobs and tasks.
    pub fn undeploy(&self, deployment_id: DeploymentId, cascade: bool) -> EngineResult<()> {
        let ids = self
            .read_definitions()
            .by_deployment
            .get(&deployment_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("deployment {deployment_id} not found")))?;

        let mut instances = Vec::new();
        for id in &ids {
            instances.extend(self.store.list_by_definition(*id)?);
        }
        if !instances.is_empty() && !cascade {
            return Err(EngineError::validation(format!(
                "deployment {deployment_id} still has {} running process instance(s)",
                instances.len()
            )));
        }
        for instance in instances {
            self.delete_process_instance(instance)?;
        }

        self.deployments.uninstall(deployment_id);
        let mut definitions = self.write_definitions();
        definitions.by_deployment.remove(&deployment_id);
        for id in ids {
            definitions.by_id.remove(&id);
        }
        info!(deployment_id = %deployment_id, cascade, "deployment removed");
        Ok(())
    }

    /// Latest version deployed for `key`.
    pub fn process_definition(&self, key: &str) -> Option<Arc<ProcessDefinition>> {
        self.read_definitions().latest(key).cloned()
    }

    pub fn process_definition_by_id(&self, id: ProcessDefinitionId) -> Option<Arc<ProcessDefinition>> {
        self.read_definitions().by_id.get(&id).cloned()
    }

    // -- process instances --------------------------------------------------

    /// Start the latest version of `key` and run it until every execution
    /// waits, parks at an async boundary or the process ends.
    pub fn start_process_instance_by_key(
        &self,
        key: &str,
        business_key: Option<String>,
        variables: Map<String, JsonValue>,
    ) -> EngineResult<ProcessInstanceId> {
        let definition = self
            .process_definition(key)
            .ok_or_else(|| EngineError::not_found(format!("no process definition with key '{key}'")))?;
        let id = ProcessInstanceId::new();

        self.command().execute("start-process-instance", || {
            let mut instance = ProcessInstance::new(
                id,
                definition.id,
                definition.key.clone(),
                definition.deployment_id,
                variables.clone(),
                self.clock.now(),
            )
            .with_business_key(business_key.clone());
            let mut interpreter = Interpreter::new(&definition.model, self.config.step_budget);
            interpreter.perform_operation(Step::new(
                AtomicOperation::ProcessStart,
                instance.root_execution_id(),
            ));
            let outcome = interpreter.run(&mut instance)?;
            self.commit(&definition, instance, &outcome, true)
        })?;

        info!(
            process_instance_id = %id,
            key = %definition.key,
            version = definition.version,
            "process instance started"
        );
        Ok(id)
    }

    /// Resume an execution parked in a wait state, setting `variables` first.
    pub fn signal(
        &self,
        execution_id: ExecutionId,
        variables: Map<String, JsonValue>,
    ) -> EngineResult<()> {
        self.command().execute("signal", || {
            let mut instance = self
                .store
                .find_by_execution(execution_id)?
                .ok_or_else(|| EngineError::not_found(format!("execution {execution_id} not found")))?;
            self.resume_waiting(&mut instance, execution_id, None, &variables)?;
            Ok(())
        })
    }

    /// Delete a process instance with its jobs and external tasks. Listeners
    /// are not notified.
    pub fn delete_process_instance(&self, id: ProcessInstanceId) -> EngineResult<()> {
        if self.store.delete(id)?.is_none() {
            return Err(EngineError::not_found(format!("process instance {id} not found")));
        }
        let jobs = self.jobs.delete_jobs_of(id)?;
        let tasks = self.external_tasks.delete_by_process_instance(id);
        info!(process_instance_id = %id, jobs, external_tasks = tasks, "process instance deleted");
        Ok(())
    }

    pub fn process_instance(&self, id: ProcessInstanceId) -> EngineResult<Option<ProcessInstance>> {
        Ok(self.store.find(id)?)
    }

    pub fn find_execution(&self, execution_id: ExecutionId) -> EngineResult<Option<Execution>> {
        Ok(self
            .store
            .find_by_execution(execution_id)?
            .and_then(|i| i.execution(execution_id).cloned()))
    }

    /// Perform a continuation step of a stored instance.
    ///
    /// Called from the async-continuation job handler, which already runs
    /// inside the job executor's command envelope. A missing instance or
    /// execution is an invariant violation and fails the job for good.
    pub fn execute_continuation(
        &self,
        process_instance_id: ProcessInstanceId,
        step: Step,
    ) -> EngineResult<()> {
        let mut instance = self.store.find(process_instance_id)?.ok_or_else(|| {
            EngineError::invariant(format!(
                "process instance {process_instance_id} of continuation does not exist"
            ))
        })?;
        if instance.execution(step.execution_id).is_none() {
            return Err(EngineError::invariant(format!(
                "execution {} of continuation does not exist",
                step.execution_id
            )));
        }
        let definition = self.definition_of(&instance)?;
        let mut interpreter = Interpreter::new(&definition.model, self.config.step_budget);
        interpreter.perform_operation(step);
        let outcome = interpreter.run(&mut instance)?;
        debug!(
            process_instance_id = %process_instance_id,
            operation = %step.operation,
            steps = outcome.steps,
            "continuation performed"
        );
        self.commit(&definition, instance, &outcome, false)
    }

    /// Move an execution on after its external task was completed.
    pub(crate) fn complete_external_task(
        &self,
        execution_id: ExecutionId,
        activity_id: &str,
        variables: &Map<String, JsonValue>,
    ) -> EngineResult<()> {
        self.command().execute("complete-external-task", || {
            let mut instance = self.store.find_by_execution(execution_id)?.ok_or_else(|| {
                EngineError::invariant(format!(
                    "execution {execution_id} of external task does not exist"
                ))
            })?;
            self.resume_waiting(&mut instance, execution_id, Some(activity_id), variables)
        })
    }

    // -- internals ----------------------------------------------------------

    fn resume_waiting(
        &self,
        instance: &mut ProcessInstance,
        execution_id: ExecutionId,
        expected_activity: Option<&str>,
        variables: &Map<String, JsonValue>,
    ) -> EngineResult<()> {
        let definition = self.definition_of(instance)?;
        let execution = instance
            .execution(execution_id)
            .ok_or_else(|| EngineError::not_found(format!("execution {execution_id} not found")))?;
        let activity_id = execution.activity_id.clone().unwrap_or_default();
        if !execution.is_waiting || !execution.is_active {
            return Err(EngineError::validation(format!(
                "execution {execution_id} is not waiting"
            )));
        }
        if expected_activity.is_some_and(|a| a != activity_id) {
            return Err(EngineError::invariant(format!(
                "execution {execution_id} waits in '{activity_id}', not '{}'",
                expected_activity.unwrap_or_default()
            )));
        }

        for (name, value) in variables {
            instance.set_variable(execution_id, name.clone(), value.clone());
        }
        let mut interpreter = Interpreter::new(&definition.model, self.config.step_budget);
        interpreter.leave(instance, execution_id)?;
        let outcome = interpreter.run(instance)?;
        debug!(
            process_instance_id = %instance.id,
            execution_id = %execution_id,
            activity_id = %activity_id,
            steps = outcome.steps,
            "waiting execution resumed"
        );
        self.commit(&definition, instance.clone(), &outcome, false)
    }

    /// Persist the result of one interpreter run, then apply its side effects.
    fn commit(
        &self,
        definition: &ProcessDefinition,
        instance: ProcessInstance,
        outcome: &RunOutcome,
        fresh: bool,
    ) -> EngineResult<()> {
        let id = instance.id;
        if outcome.ended {
            if !fresh {
                self.store.save(&instance)?;
                self.store.delete(id)?;
                self.jobs.delete_jobs_of(id)?;
                self.external_tasks.delete_by_process_instance(id);
            }
            info!(process_instance_id = %id, key = %definition.key, "process instance ended");
            return Ok(());
        }

        let stored = if fresh {
            self.store.insert(instance)?
        } else {
            self.store.save(&instance)?
        };
        for deferred in &outcome.deferred {
            self.apply(definition, &stored, deferred)?;
        }
        Ok(())
    }

    fn apply(
        &self,
        definition: &ProcessDefinition,
        instance: &ProcessInstance,
        deferred: &Deferred,
    ) -> EngineResult<()> {
        match deferred {
            Deferred::Continuation(step) => {
                let payload = serde_json::to_value(step).map_err(|e| {
                    EngineError::invariant(format!("failed to encode continuation: {e}"))
                })?;
                let job = NewJob::new(ASYNC_CONTINUATION, payload)
                    .for_execution(step.execution_id, instance.id)
                    .with_definition(definition.id, definition.deployment_id)
                    .with_priority(self.config.continuation_priority);
                let job_id = self.jobs.create_job(job)?;
                debug!(
                    job_id = %job_id,
                    operation = %step.operation,
                    execution_id = %step.execution_id,
                    "async continuation scheduled"
                );
            }
            Deferred::ExternalTask {
                execution_id,
                activity_id,
                topic,
            } => {
                let task = NewExternalTask::new(
                    topic.clone(),
                    *execution_id,
                    instance.id,
                    activity_id.clone(),
                )
                .with_variables(instance.variables(*execution_id));
                let task_id = self.external_tasks.create(task)?;
                debug!(task_id = %task_id, topic = %topic, "external task published");
            }
        }
        Ok(())
    }

    fn definition_of(&self, instance: &ProcessInstance) -> EngineResult<Arc<ProcessDefinition>> {
        self.process_definition_by_id(instance.definition_id)
            .ok_or_else(|| {
                EngineError::invariant(format!(
                    "process definition {} of instance {} is not deployed",
                    instance.definition_id, instance.id
                ))
            })
    }

    fn command(&self) -> stepflow_jobs::CommandExecutor {
        self.jobs.executor().command()
    }

    fn read_definitions(&self) -> std::sync::RwLockReadGuard<'_, Definitions> {
        self.definitions.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_definitions(&self) -> std::sync::RwLockWriteGuard<'_, Definitions> {
        self.definitions.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for RuntimeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeService")
            .field("definitions", &self.read_definitions().by_id.len())
            .field("jobs", &self.jobs.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
