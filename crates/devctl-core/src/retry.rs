//! Bounded retry for transport-level failures.
//!
//! Only errors for which [`DriverError::is_transient`] holds are retried.
//! Invalid input, unsupported operations and controller error codes fail on the
//! first attempt. `max_attempts` counts every attempt including the first, so
//! the default of 10 means one try plus up to nine retries.

use crate::error::DriverError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry budget and backoff schedule (`[retry]` in the runtime settings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    /// Factor applied to the delay after every retry.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 20,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

/// The last error once the attempt budget ran out, and how many attempts were
/// made.
#[derive(Debug)]
pub struct RetryExhausted {
    /// Error of the last attempt.
    pub error: DriverError,
    /// Attempts made, the failing one included.
    pub attempts: u32,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Policy with `max_attempts` and no sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Attempts allowed, never less than one.
    pub fn attempt_limit(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay slept after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// `op` is called once per attempt and must perform a complete exchange
    /// (including taking the port lease) so that the lease is never held while
    /// sleeping between attempts.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<(T, u32), RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let limit = self.attempt_limit();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok((value, attempt));
                }
                Err(error) if error.is_transient() && attempt < limit => {
                    let backoff = self.delay_after(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Attempt failed, retrying"
                    );
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(error) => {
                    if error.is_transient() {
                        tracing::warn!(operation, attempts = attempt, error = %error, "Retries exhausted");
                    }
                    return Err(RetryExhausted {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}
