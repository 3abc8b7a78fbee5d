//! Bounded retry and backoff logic for Rekindle remote operations
//!
//! Every retried operation in Rekindle has a fixed attempt budget. Delays
//! between attempts come from a [`backoff::backoff::Backoff`] policy and are
//! slept on the tokio timer, so paused-time tests can drive them.

use backoff::backoff::{Backoff, Constant};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default attempt budget for operator-initiated remote calls
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Outcome of a retry loop that did not produce a value
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("Operation '{operation}' failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: usize,
        last: E,
    },
    #[error("Permanent error in '{operation}' on attempt {attempt}: {error}")]
    Permanent {
        operation: &'static str,
        attempt: usize,
        error: E,
    },
}

impl<E> RetryError<E> {
    /// The error returned by the final attempt
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent { error, .. } => error,
        }
    }

    /// Number of attempts made before giving up
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Permanent { attempt, .. } => *attempt,
        }
    }
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Run `f` up to `max_attempts` times, sleeping between attempts according to `policy`.
///
/// `f` receives the 1-based attempt number. A permanent error stops the loop
/// immediately. The loop also stops when the policy runs out of delays.
///
/// # Arguments
/// * `op_name` - Operation name used in logs and errors
/// * `max_attempts` - Attempt budget, at least one attempt is always made
/// * `policy` - Source of inter-attempt delays
/// * `f` - The operation
pub async fn retry_bounded<F, Fut, T, E, B>(
    op_name: &'static str,
    max_attempts: usize,
    mut policy: B,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + Display,
    B: Backoff,
{
    let max_attempts = max_attempts.max(1);
    policy.reset();
    let mut attempt = 1;

    loop {
        debug!(operation = op_name, attempt, max_attempts, "Attempting operation");

        match f(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = op_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_permanent() => {
                warn!(operation = op_name, attempt, error = %err, "Operation failed permanently");
                return Err(RetryError::Permanent {
                    operation: op_name,
                    attempt,
                    error: err,
                });
            }
            Err(err) => {
                warn!(operation = op_name, attempt, max_attempts, error = %err, "Operation attempt failed");

                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        operation: op_name,
                        attempts: attempt,
                        last: err,
                    });
                }

                let Some(delay) = policy.next_backoff() else {
                    return Err(RetryError::Exhausted {
                        operation: op_name,
                        attempts: attempt,
                        last: err,
                    });
                };

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Retry with the default remote policy and attempt budget
pub async fn with_backoff<F, Fut, T, E>(op_name: &'static str, f: F) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + Display,
{
    retry_bounded(op_name, DEFAULT_MAX_ATTEMPTS, remote_backoff_policy(), f).await
}

/// Fixed delay between attempts
pub fn constant_policy(delay: Duration) -> Constant {
    Constant::new(delay)
}

/// Backoff policy for calls against the remote blob API
pub fn remote_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(500))
        .with_max_interval(Duration::from_secs(10))
        .with_max_elapsed_time(None)
        .with_multiplier(2.0)
        .build()
}
