//! Retry policy for blob transfers.
//!
//! Blob gateways shed load with 502/503 and drop long-lived connections, so
//! whole-file attempts are retried with bounded exponential backoff. Only
//! transient failures are retried; a 404 or permission error fails fast.

use std::time::Duration;

use crate::core::Error;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff before re-running the attempt that just failed (0-based):
    /// initial * multiplier^attempt, capped at max_backoff.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = self.initial_backoff.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.min(63) as i32);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }

    /// Whether the failure of the given 0-based attempt warrants another go.
    pub fn should_retry(&self, err: &Error, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts && err.is_transient()
    }
}
