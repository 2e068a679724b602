use thiserror::Error;

use stepflow_core::EngineError;
use stepflow_jobs::ConfigError;

/// Errors raised by the polling client and its handlers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The engine rejected a request.
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("client has no topic subscriptions")]
    NoSubscriptions,

    #[error("topic '{0}' is subscribed twice")]
    DuplicateSubscription(String),

    /// A handler gave up on a task.
    #[error("handler failed: {0}")]
    Handler(String),

    #[error("failed to start polling thread: {0}")]
    Spawn(String),
}

impl ClientError {
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}

impl From<ClientError> for EngineError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Engine(e) => e,
            ClientError::Config(e) => e.into(),
            ClientError::NoSubscriptions | ClientError::DuplicateSubscription(_) => {
                EngineError::validation(err.to_string())
            }
            ClientError::Handler(msg) => EngineError::failure(msg),
            ClientError::Spawn(msg) => EngineError::infrastructure(msg),
        }
    }
}
