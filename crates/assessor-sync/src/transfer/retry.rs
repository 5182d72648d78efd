//! Bounded retry with exponential backoff
//!
//! Wraps one fallible async operation. Every attempt runs under its own
//! timeout, the delay before attempt `n + 1` is `base_delay * 2^(n - 1)`
//! capped at `max_delay`, and a cancellation token interrupts both the
//! attempt and the backoff sleep.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry policy for a single operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Deadline for each individual attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(300),
        }
    }
}

/// Successful result together with the attempt that produced it
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryFailure {
    /// Every attempt failed; carries the last error message
    Exhausted { attempts: u32, last_error: String },
    /// The cancellation token fired
    Cancelled { attempts: u32 },
}

impl RetryFailure {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryFailure::Exhausted { attempts, .. } | RetryFailure::Cancelled { attempts } => {
                *attempts
            },
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, attempts run out, or `cancel` fires
    ///
    /// `op` receives the 1-based attempt number. Attempts are strictly
    /// sequential.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<Attempted<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(RetryFailure::Cancelled {
                    attempts: attempt - 1,
                });
            }

            debug!(label, attempt, max_attempts, "Starting attempt");

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryFailure::Cancelled { attempts: attempt });
                }
                outcome = tokio::time::timeout(self.attempt_timeout, op(attempt)) => outcome,
            };

            match outcome {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(label, attempt, "Succeeded after retry");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                },
                Ok(Err(e)) => last_error = format!("{:#}", e),
                Err(_) => {
                    last_error = format!("attempt timed out after {:?}", self.attempt_timeout)
                },
            }

            if attempt < max_attempts {
                let delay = self.backoff(attempt);
                warn!(
                    label,
                    attempt,
                    max_attempts,
                    error = %last_error,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(RetryFailure::Cancelled { attempts: attempt });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                warn!(label, attempt, error = %last_error, "Final attempt failed");
            }
        }

        Err(RetryFailure::Exhausted {
            attempts: max_attempts,
            last_error,
        })
    }
}
