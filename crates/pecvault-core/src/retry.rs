//! Retry executor with bounded exponential backoff.
//!
//! Wraps any fallible remote operation (IMAP command, S3 call). Only
//! *transient* failures are retried; fatal failures (authentication
//! rejection, malformed configuration) propagate immediately. After
//! `max_retries` exhausted retries, the last error surfaces to the
//! caller.

use tracing::warn;

use crate::config::RetryPolicy;

/// Classification of failures for the retry executor.
pub trait Retryable {
    /// Returns true if a retry may succeed.
    fn is_transient(&self) -> bool;
}

impl Retryable for crate::Error {
    fn is_transient(&self) -> bool {
        Self::is_transient(self)
    }
}

impl Retryable for pecvault_imap::Error {
    fn is_transient(&self) -> bool {
        Self::is_transient(self)
    }
}

/// Runs `operation`, retrying transient failures per `policy`.
///
/// The delay before retry `n` is `initial_delay * multiplier^(n-1)`.
/// Each failed attempt is logged with the attempt count and the
/// upcoming delay.
///
/// # Errors
///
/// Returns the first fatal error, or the last transient error once
/// retries are exhausted.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt: u32 = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => {
                warn!(operation, attempt, error = %e, "fatal failure, not retrying");
                return Err(e);
            }
            Err(e) if attempt > policy.max_retries => {
                warn!(
                    operation,
                    attempts = attempt,
                    error = %e,
                    "retries exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    error = %e,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
