//! `stepflow-core`: engine-wide building blocks.
//!
//! This crate holds the pieces every other layer agrees on: typed identifiers,
//! the error taxonomy, the time source and the backoff calculation shared by
//! the job acquisition loop and external polling clients. It has no IO.

pub mod backoff;
pub mod clock;
pub mod error;
pub mod id;

pub use backoff::{Backoff, BackoffPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use id::{
    DeploymentId, ExecutionId, ExternalTaskId, IncidentId, JobId, ProcessDefinitionId,
    ProcessInstanceId,
};
