//! Glue between the runtime and the job/external-task services.

use std::sync::Weak;

use serde_json::{Map, Value as JsonValue};

use stepflow_core::{EngineError, EngineResult};
use stepflow_jobs::{ExternalTask, ExternalTaskCompletion, JobContext, JobHandler};

use crate::operation::Step;
use crate::runtime::RuntimeService;

/// Handler type of jobs that continue an execution asynchronously.
pub const ASYNC_CONTINUATION: &str = "async-continuation";

fn runtime(runtime: &Weak<RuntimeService>) -> EngineResult<std::sync::Arc<RuntimeService>> {
    runtime
        .upgrade()
        .ok_or_else(|| EngineError::infrastructure("process runtime is shut down"))
}

/// Runs the step carried by an `async-continuation` job.
pub struct AsyncContinuationHandler {
    runtime: Weak<RuntimeService>,
}

impl AsyncContinuationHandler {
    pub fn new(runtime: Weak<RuntimeService>) -> Self {
        Self { runtime }
    }
}

impl JobHandler for AsyncContinuationHandler {
    fn handler_type(&self) -> &str {
        ASYNC_CONTINUATION
    }

    fn execute(&self, ctx: &JobContext<'_>) -> EngineResult<()> {
        let job = ctx.job;
        let step: Step = serde_json::from_value(job.handler_configuration.clone()).map_err(|e| {
            EngineError::invariant(format!("job {} carries no valid continuation: {e}", job.id))
        })?;
        let process_instance_id = job.process_instance_id.ok_or_else(|| {
            EngineError::invariant(format!("job {} is not attached to a process instance", job.id))
        })?;
        runtime(&self.runtime)?.execute_continuation(process_instance_id, step)
    }
}

/// Moves the waiting execution on when a worker completes its external task.
pub struct ExternalTaskBridge {
    runtime: Weak<RuntimeService>,
}

impl ExternalTaskBridge {
    pub fn new(runtime: Weak<RuntimeService>) -> Self {
        Self { runtime }
    }
}

impl ExternalTaskCompletion for ExternalTaskBridge {
    fn task_completed(
        &self,
        task: &ExternalTask,
        variables: &Map<String, JsonValue>,
    ) -> EngineResult<()> {
        runtime(&self.runtime)?.complete_external_task(task.execution_id, &task.activity_id, variables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepflow_core::{ExecutionId, JobId};
    use stepflow_jobs::NewJob;

    use crate::operation::AtomicOperation;

    #[test]
    fn continuation_payload_is_the_step() {
        let step = Step::new(AtomicOperation::ActivityEnd, ExecutionId::from_u128(3));
        let payload = serde_json::to_value(step).unwrap();
        assert_eq!(
            payload,
            json!({
                "operation": "activity-end",
                "execution_id": ExecutionId::from_u128(3),
                "skip_async": false,
            })
        );
        assert_eq!(serde_json::from_value::<Step>(payload).unwrap(), step);
    }

    #[test]
    fn malformed_payload_is_an_invariant_violation() {
        let handler = AsyncContinuationHandler::new(Weak::new());
        let job = NewJob::new(ASYNC_CONTINUATION, json!({"operation": "fly"})).into_job(
            JobId::from_u128(1),
            3,
            chrono::Utc::now(),
        );
        let err = handler
            .execute(&JobContext {
                job: &job,
                lock_owner: None,
                now: chrono::Utc::now(),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[test]
    fn dropped_runtime_is_an_infrastructure_failure() {
        let handler = AsyncContinuationHandler::new(Weak::new());
        let step = Step::new(AtomicOperation::ActivityStart, ExecutionId::from_u128(3));
        let job = NewJob::new(ASYNC_CONTINUATION, serde_json::to_value(step).unwrap())
            .for_execution(step.execution_id, stepflow_core::ProcessInstanceId::from_u128(4))
            .into_job(JobId::from_u128(1), 3, chrono::Utc::now());
        let err = handler
            .execute(&JobContext {
                job: &job,
                lock_owner: None,
                now: chrono::Utc::now(),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Infrastructure(_)));
    }
}
