//! Engine error model.

use thiserror::Error;

/// Result type used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-level error.
///
/// The variants follow the failure taxonomy the scheduler reacts to: a
/// conflict is retried locally, a fault or failure consumes a job retry, an
/// infrastructure problem leaves the job lock to expire, and an invariant
/// violation is terminal for the single job that hit it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Another writer changed the record between read and write.
    #[error("optimistic locking conflict: {0}")]
    OptimisticLocking(String),

    /// A business fault raised by a listener or behaviour (checked failure).
    #[error("process fault: {0}")]
    Fault(String),

    /// An unchecked failure raised while running a listener, behaviour or handler.
    #[error("execution failed: {0}")]
    Failure(String),

    /// The store or deployment needed to do the work is unavailable.
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    /// An engine invariant was violated (e.g. a job references a missing execution).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller supplied an invalid argument.
    #[error("validation failed: {0}")]
    Validation(String),
}

/// Coarse classification of an [`EngineError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Conflict,
    Business,
    Infrastructure,
    Programming,
    Caller,
}

impl EngineError {
    pub fn optimistic_locking(msg: impl Into<String>) -> Self {
        Self::OptimisticLocking(msg.into())
    }

    pub fn fault(msg: impl Into<String>) -> Self {
        Self::Fault(msg.into())
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self::Failure(msg.into())
    }

    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::OptimisticLocking(_) => ErrorKind::Conflict,
            EngineError::Fault(_) | EngineError::Failure(_) => ErrorKind::Business,
            EngineError::Infrastructure(_) => ErrorKind::Infrastructure,
            EngineError::InvariantViolation(_) => ErrorKind::Programming,
            EngineError::NotFound(_) | EngineError::Validation(_) => ErrorKind::Caller,
        }
    }

    pub fn is_optimistic_locking(&self) -> bool {
        matches!(self, EngineError::OptimisticLocking(_))
    }
}
