//! Bounded retry with backoff for idempotent operations.
//!
//! Used by the metadata probe only; the transcode path never retries. The
//! probe policy is deterministic: `RetryConfig::probe()` makes at most three
//! attempts with 2s and 4s pauses in between, and only errors that report
//! themselves as `Retryable` are repeated.

use crate::core::config;
use crate::core::metrics;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Retry-related errors.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// All retries exhausted, or the error was not retryable
    #[error("Max retries ({max_retries}) exhausted")]
    MaxRetriesExhausted { max_retries: u32, last_error: E },
}

impl<E> RetryError<E> {
    /// Returns the error from the last attempt.
    pub fn into_last_error(self) -> E {
        match self {
            RetryError::MaxRetriesExhausted { last_error, .. } => last_error,
        }
    }
}

/// Retry strategy configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Policy for metadata probes: 3 attempts total, 2s then 4s.
    pub fn probe() -> Self {
        Self {
            max_retries: config::probe::MAX_ATTEMPTS.saturating_sub(1),
            initial_delay: config::probe::retry_base_delay(),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Calculates delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(base_delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Result of a retry attempt.
#[derive(Debug)]
pub struct RetryResult<T, E> {
    /// The final result (success or last error)
    pub result: Result<T, RetryError<E>>,
    /// Number of attempts made
    pub attempts: u32,
    /// Total time spent retrying
    pub total_duration: Duration,
}

impl<T, E> RetryResult<T, E> {
    /// Collapses into a plain result carrying the last error.
    pub fn into_result(self) -> Result<T, E> {
        self.result.map_err(RetryError::into_last_error)
    }
}

/// Determines if an error is retryable.
pub trait Retryable {
    /// Returns true if the error should be retried.
    fn is_retryable(&self) -> bool;

    /// Returns an optional hint for retry delay.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for std::io::Error {
    fn is_retryable(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self.kind(),
            ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
        )
    }
}

/// Executes an async operation with retry logic.
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation` - The async operation to execute
///
/// # Returns
/// A `RetryResult` containing either the successful result or the last error.
pub async fn retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let start = std::time::Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(value) => {
                return RetryResult {
                    result: Ok(value),
                    attempts,
                    total_duration: start.elapsed(),
                };
            }
            Err(e) if attempts <= config.max_retries && e.is_retryable() => {
                metrics::RETRY_ATTEMPTS_TOTAL
                    .with_label_values(&[&attempts.to_string()])
                    .inc();

                // Calculate delay (respect retry_after hint if provided)
                let delay = e
                    .retry_after()
                    .unwrap_or_else(|| config.delay_for_attempt(attempts - 1));

                log::warn!(
                    "Attempt {}/{} failed (retrying in {:?}): {}",
                    attempts,
                    config.max_retries + 1,
                    delay,
                    e
                );

                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return RetryResult {
                    result: Err(RetryError::MaxRetriesExhausted {
                        max_retries: config.max_retries,
                        last_error: e,
                    }),
                    attempts,
                    total_duration: start.elapsed(),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(bool); // bool = is_retryable

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError(retryable={})", self.0)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig::probe().initial_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result = retry(&fast(), || async { Ok::<_, TestError>(42) }).await;

        assert!(result.result.is_ok());
        assert_eq!(result.attempts, 1);
        assert_eq!(result.into_result().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry(&fast(), || {
            let counter = counter_clone.clone();
            async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(TestError(true))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert!(result.result.is_ok());
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_probe_policy_stops_after_three_attempts() {
        let result = retry(&fast(), || async { Err::<i32, _>(TestError(true)) }).await;

        assert!(result.result.is_err());
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry(&fast(), || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError(false))
            }
        })
        .await;

        assert!(result.result.is_err());
        assert_eq!(result.attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_probe_delays_are_deterministic() {
        let config = RetryConfig::probe();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::probe();
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(16));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(30));
    }
}
