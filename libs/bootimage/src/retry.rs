//! Bounded exponential backoff for idempotent backend calls.
//!
//! Only calls that are safe to repeat go through here: object metadata reads
//! and stream opens. Copying stream bytes is never retried.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a retried call gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The last attempt failed and no further attempts are allowed, either
    /// because the error is permanent or the budget is spent.
    #[error("failed after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: E,
    },

    /// The cancellation token fired before the call succeeded.
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Failed { attempts, .. } | Self::Cancelled { attempts } => *attempts,
        }
    }
}

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Growth factor between consecutive delays.
    pub multiplier: f64,

    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,

    /// Give up once this much time has passed since the first attempt.
    pub deadline: Option<Duration>,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
            deadline: None,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given (zero-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let base = base.min(self.max_delay.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            let spread = base * jitter;
            base + rand::rng().random_range(-spread..=spread)
        } else {
            base
        };

        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Run `op` until it succeeds, returns a non-retryable error, the attempt
    /// budget or deadline runs out, or `cancel` fires.
    pub async fn run<T, E, F, Fut>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        is_retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let started = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
                result = op() => result,
            };

            let err = match result {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(op = name, attempts, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !is_retryable(&err) || attempts >= max_attempts {
                return Err(RetryError::Failed {
                    attempts,
                    source: err,
                });
            }

            let delay = self.delay(attempts - 1);
            if let Some(deadline) = self.deadline {
                if started.elapsed() + delay > deadline {
                    warn!(op = name, attempts, error = %err, "Retry deadline reached");
                    return Err(RetryError::Failed {
                        attempts,
                        source: err,
                    });
                }
            }

            warn!(
                op = name,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts }),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
