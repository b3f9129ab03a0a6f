//! Retry policies for destination writes and metadata transactions.
//!
//! Three failure classes are distinguished:
//!
//! | Class | Example | Policy |
//! |-------|---------|--------|
//! | Availability | connection refused, timeout, 5xx | exponential backoff, 2s base, 4 attempts, 60s cap |
//! | Permanent | auth or validation error (4xx) | fail immediately |
//! | Deadlock | metadata-store lock contention | 100ms × 2^attempt, 3 attempts |
//!
//! Cancellation is never an attempt: the token is checked before every try
//! and raced against every backoff sleep, and a cancelled operation is
//! re-raised as [`SyncError::Cancelled`] untouched.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{DestinationError, MetadataError, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn destination() -> Self {
        Self {
            base: Duration::from_secs(2),
            max_attempts: 4,
            max_delay: Duration::from_secs(60),
        }
    }

    pub fn deadlock() -> Self {
        Self {
            base: Duration::from_millis(100),
            max_attempts: 3,
            max_delay: Duration::from_secs(5),
        }
    }

    /// Policy with no sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            base: Duration::ZERO,
            max_attempts,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based): `base × 2^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }
}

enum Disposition {
    Retry,
    Fail,
    Cancelled,
}

enum RetryError<E> {
    Cancelled,
    Failed { error: E, attempts: u32 },
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), ()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(()),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

async fn run<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
    disposition: fn(&E) -> Disposition,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = op() => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        attempt += 1;

        match disposition(&error) {
            Disposition::Cancelled => return Err(RetryError::Cancelled),
            Disposition::Fail => {
                tracing::warn!(target_name = what, error = %error, "non-retryable failure");
                return Err(RetryError::Failed {
                    error,
                    attempts: attempt,
                });
            }
            Disposition::Retry if attempt >= policy.max_attempts => {
                tracing::error!(target_name = what, attempts = attempt, error = %error, "retries exhausted");
                return Err(RetryError::Failed {
                    error,
                    attempts: attempt,
                });
            }
            Disposition::Retry => {
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    target_name = what,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying after transient failure"
                );
                if sleep_or_cancel(delay, cancel).await.is_err() {
                    return Err(RetryError::Cancelled);
                }
            }
        }
    }
}

fn destination_disposition(err: &DestinationError) -> Disposition {
    match err {
        DestinationError::Unavailable(_) => Disposition::Retry,
        DestinationError::Permanent(_) => Disposition::Fail,
        DestinationError::Cancelled => Disposition::Cancelled,
    }
}

fn deadlock_disposition(err: &MetadataError) -> Disposition {
    match err {
        MetadataError::Deadlock(_) => Disposition::Retry,
        MetadataError::Cancelled => Disposition::Cancelled,
        _ => Disposition::Fail,
    }
}

/// Run a destination operation, retrying availability failures only.
pub async fn retry_destination<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    destination: &str,
    op: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DestinationError>>,
{
    match run(policy, cancel, destination, op, destination_disposition).await {
        Ok(value) => Ok(value),
        Err(RetryError::Cancelled) => Err(SyncError::Cancelled),
        Err(RetryError::Failed { error, .. }) => Err(SyncError::destination(destination, error)),
    }
}

/// Run a metadata transaction, retrying deadlocks only.
pub async fn retry_deadlock<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MetadataError>>,
{
    match run(policy, cancel, "metadata", op, deadlock_disposition).await {
        Ok(value) => Ok(value),
        Err(RetryError::Cancelled) => Err(SyncError::Cancelled),
        Err(RetryError::Failed { error, .. }) => Err(SyncError::Metadata(error)),
    }
}
