//! The engine API the client talks to.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value as JsonValue};

use stepflow_core::{EngineResult, ExternalTaskId};
use stepflow_jobs::{ExternalTaskService, FetchRequest, LockedExternalTask};

/// Requests a polling client sends to the engine.
pub trait ExternalTaskTransport: Send + Sync {
    fn fetch_and_lock(&self, request: &FetchRequest) -> EngineResult<Vec<LockedExternalTask>>;

    fn complete(
        &self,
        id: ExternalTaskId,
        worker_id: &str,
        variables: Map<String, JsonValue>,
    ) -> EngineResult<()>;

    fn handle_failure(
        &self,
        id: ExternalTaskId,
        worker_id: &str,
        error_message: &str,
        error_details: Option<&str>,
        retries: u32,
        retry_timeout: Duration,
    ) -> EngineResult<()>;

    fn extend_lock(&self, id: ExternalTaskId, worker_id: &str, duration: Duration) -> EngineResult<()>;

    fn unlock(&self, id: ExternalTaskId) -> EngineResult<()>;
}

/// In-process transport: the client runs next to the engine.
impl ExternalTaskTransport for ExternalTaskService {
    fn fetch_and_lock(&self, request: &FetchRequest) -> EngineResult<Vec<LockedExternalTask>> {
        ExternalTaskService::fetch_and_lock(self, request)
    }

    fn complete(
        &self,
        id: ExternalTaskId,
        worker_id: &str,
        variables: Map<String, JsonValue>,
    ) -> EngineResult<()> {
        ExternalTaskService::complete(self, id, worker_id, variables)
    }

    fn handle_failure(
        &self,
        id: ExternalTaskId,
        worker_id: &str,
        error_message: &str,
        error_details: Option<&str>,
        retries: u32,
        retry_timeout: Duration,
    ) -> EngineResult<()> {
        ExternalTaskService::handle_failure(
            self,
            id,
            worker_id,
            error_message,
            error_details,
            retries,
            retry_timeout,
        )
    }

    fn extend_lock(&self, id: ExternalTaskId, worker_id: &str, duration: Duration) -> EngineResult<()> {
        ExternalTaskService::extend_lock(self, id, worker_id, duration)
    }

    fn unlock(&self, id: ExternalTaskId) -> EngineResult<()> {
        ExternalTaskService::unlock(self, id)
    }
}

impl<T: ExternalTaskTransport + ?Sized> ExternalTaskTransport for Arc<T> {
    fn fetch_and_lock(&self, request: &FetchRequest) -> EngineResult<Vec<LockedExternalTask>> {
        (**self).fetch_and_lock(request)
    }

    fn complete(
        &self,
        id: ExternalTaskId,
        worker_id: &str,
        variables: Map<String, JsonValue>,
    ) -> EngineResult<()> {
        (**self).complete(id, worker_id, variables)
    }

    fn handle_failure(
        &self,
        id: ExternalTaskId,
        worker_id: &str,
        error_message: &str,
        error_details: Option<&str>,
        retries: u32,
        retry_timeout: Duration,
    ) -> EngineResult<()> {
        (**self).handle_failure(id, worker_id, error_message, error_details, retries, retry_timeout)
    }

    fn extend_lock(&self, id: ExternalTaskId, worker_id: &str, duration: Duration) -> EngineResult<()> {
        (**self).extend_lock(id, worker_id, duration)
    }

    fn unlock(&self, id: ExternalTaskId) -> EngineResult<()> {
        (**self).unlock(id)
    }
}
