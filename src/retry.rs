//! Retry logic with exponential backoff
//!
//! Used for work that is retried in place with its own bounded budget, such as
//! individual media downloads. Page fetching uses the session-level
//! [`BackoffController`](crate::backoff::BackoffController) instead, because it
//! also has to decide when to rotate routes.
//!
//! # Example
//!
//! ```no_run
//! use stream_harvest::FetchError;
//! use stream_harvest::config::RetryConfig;
//! use stream_harvest::retry::with_retry;
//!
//! # async fn fetch_thumbnail() -> Result<Vec<u8>, FetchError> { Ok(Vec::new()) }
//! # async fn example() -> Result<(), FetchError> {
//! // Throttled and retryable transport errors are retried; fatal ones return at once
//! let bytes = with_retry(&RetryConfig::default(), fetch_thumbnail).await?;
//! # let _ = bytes;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, FetchError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (throttling, connection reset) should return `true`.
/// Permanent failures (target gone, disk full) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;

    /// Remote-mandated wait before the next attempt, if the error carries one
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Throttled { .. } => true,
            FetchError::Transport { retryable, .. } => *retryable,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::Throttled { retry_after } => *retry_after,
            FetchError::Transport { .. } => None,
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Fetch(e) => e.is_retryable(),
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // Storage, database and configuration problems need operator attention
            Error::Storage(_)
            | Error::Database(_)
            | Error::Sqlx(_)
            | Error::Config { .. }
            | Error::PoolExhausted(_)
            | Error::Serialization(_)
            | Error::NotFound(_)
            | Error::Other(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Fetch(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// A remote `retry_after` hint replaces the computed delay for that attempt when it
/// is longer; the hint is never shortened by jitter.
///
/// # Returns
///
/// Returns the successful result or the last error after all retry attempts are exhausted.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                let backoff = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };
                let wait = match e.retry_after() {
                    Some(mandated) => mandated.max(backoff),
                    None => backoff,
                };

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = wait.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(wait).await;

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The actual delay will be between `delay` and `2 * delay`.
pub(crate) fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
