//! Idle backoff shared by the job acquisition loop and external polling clients.
//!
//! The wait for a level is `0` at level 0 and
//! `min(starting_wait * factor^(level - 1), max_wait)` above it. Both sides of
//! the polling protocol use this exact calculation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Stateless wait calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Wait after the first empty cycle.
    pub starting_wait: Duration,
    /// Multiplier applied per additional empty cycle (expected to be >= 1).
    pub factor: u32,
    /// Upper bound on the wait.
    pub max_wait: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            starting_wait: Duration::from_millis(500),
            factor: 2,
            max_wait: Duration::from_millis(60_000),
        }
    }
}

impl BackoffPolicy {
    pub fn new(starting_wait: Duration, factor: u32, max_wait: Duration) -> Self {
        Self {
            starting_wait,
            factor,
            max_wait,
        }
    }

    /// Wait for a given level (number of consecutive empty cycles).
    pub fn wait_for_level(&self, level: u32) -> Duration {
        if level == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.starting_wait.as_millis() as f64;
        let max_ms = self.max_wait.as_millis() as f64;
        let exp = (self.factor as f64).powi((level - 1).min(i32::MAX as u32) as i32);

        let wait_ms = (base_ms * exp).min(max_ms);
        Duration::from_millis(wait_ms.max(0.0) as u64)
    }
}

/// Per-loop backoff state (the level counter plus its policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Backoff {
    policy: BackoffPolicy,
    level: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, level: 0 }
    }

    /// Feed the result of the latest cycle.
    pub fn reconfigure(&mut self, found_any: bool) {
        if found_any {
            self.level = 0;
        } else {
            self.level = self.level.saturating_add(1);
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Wait before the next cycle.
    pub fn wait(&self) -> Duration {
        self.policy.wait_for_level(self.level)
    }
}
