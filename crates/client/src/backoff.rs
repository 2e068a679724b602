//! Client-side idle backoff.

use std::time::Duration;

use stepflow_core::{Backoff, BackoffPolicy};

/// Decides how long the client waits between fetches.
pub trait BackoffStrategy: Send {
    /// Feed the number of tasks the latest fetch returned.
    fn reconfigure(&mut self, fetched: usize);

    fn wait(&self) -> Duration;
}

/// Exponential backoff over the engine's policy: no wait while fetches
/// return tasks, growing waits while they come back empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExponentialBackoff {
    inner: Backoff,
}

impl ExponentialBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            inner: Backoff::new(policy),
        }
    }

    pub fn level(&self) -> u32 {
        self.inner.level()
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn reconfigure(&mut self, fetched: usize) {
        self.inner.reconfigure(fetched > 0);
    }

    fn wait(&self) -> Duration {
        self.inner.wait()
    }
}

/// Fetch again right away, whatever the result.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl BackoffStrategy for NoBackoff {
    fn reconfigure(&mut self, _fetched: usize) {}

    fn wait(&self) -> Duration {
        Duration::ZERO
    }
}
