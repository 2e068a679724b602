//! Command envelope: re-runs a unit of work after optimistic locking conflicts.

use tracing::{debug, warn};

use stepflow_core::{EngineError, EngineResult};

/// Runs commands, retrying the whole command on `OptimisticLocking`.
///
/// The closure must be safe to run from scratch: it re-reads everything it
/// writes, so a retry sees the state the competing writer left behind.
#[derive(Debug, Clone, Copy)]
pub struct CommandExecutor {
    max_retries: u32,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl CommandExecutor {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run `command`; conflicts are retried up to `max_retries` times, then surfaced.
    pub fn execute<T, F>(&self, name: &str, mut command: F) -> EngineResult<T>
    where
        F: FnMut() -> EngineResult<T>,
    {
        let mut attempt = 0u32;
        loop {
            match command() {
                Err(err @ EngineError::OptimisticLocking(_)) => {
                    if attempt >= self.max_retries {
                        warn!(command = name, attempts = attempt + 1, error = %err, "giving up after repeated conflicts");
                        return Err(err);
                    }
                    attempt += 1;
                    debug!(command = name, attempt, error = %err, "optimistic locking conflict, retrying");
                }
                other => return other,
            }
        }
    }
}
