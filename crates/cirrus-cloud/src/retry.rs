//! Bounded exponential backoff for provider operations.
//!
//! Cloud APIs reject operations transiently (volume still provisioning, VM
//! not booted enough to attach disks), so drivers wrap those calls in a
//! retry loop with a wall-clock deadline. Exhausting the deadline raises a
//! distinguishable [`RetryError::DeadlineExceeded`] carrying the last
//! provider error, never a silent fall-through.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Shape of one retry loop: seed delay, growth factor, delay cap and an
/// overall wall-clock deadline.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub deadline: Duration,
}

impl RetryPolicy {
    pub const fn new(
        initial_delay: Duration,
        backoff_factor: f64,
        max_delay: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            initial_delay,
            backoff_factor,
            max_delay,
            deadline,
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let grown = current.mul_f64(self.backoff_factor);
        grown.min(self.max_delay)
    }
}

/// Why a retry loop gave up.
#[derive(Debug, Error)]
pub enum RetryError<E: std::fmt::Display + std::fmt::Debug> {
    /// The deadline ran out; `last` is the most recent provider error.
    #[error("deadline of {deadline:?} exceeded after {elapsed:?}: {last}")]
    DeadlineExceeded {
        deadline: Duration,
        elapsed: Duration,
        last: E,
    },
    /// The operation failed with an error the caller classified as
    /// non-retryable; aborted immediately.
    #[error("{0}")]
    Fatal(E),
}

/// Run `op` until it succeeds, the error is non-retryable, or the deadline
/// passes. `retryable` classifies errors; anything it rejects aborts the
/// loop immediately.
pub async fn retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    label: &str,
    retryable: R,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display + std::fmt::Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut delay = policy.initial_delay;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !retryable(&err) => return Err(RetryError::Fatal(err)),
            Err(err) => {
                let elapsed = started.elapsed();
                if elapsed >= policy.deadline {
                    return Err(RetryError::DeadlineExceeded {
                        deadline: policy.deadline,
                        elapsed,
                        last: err,
                    });
                }
                tracing::debug!(%label, %err, ?delay, "retrying after transient error");
                tokio::time::sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}
