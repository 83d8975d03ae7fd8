//! Retry utilities: exponential backoff with jitter, and bounded conflict retry.
//!
//! Two distinct retry loops live here:
//! - [`retry_with_backoff`] retries any transient failure with growing delays
//! - [`retry_on_conflict`] retries only optimistic-concurrency conflicts,
//!   immediately and a bounded number of times, inside one reconciliation
//!
//! # Example
//!
//! ```ignore
//! use trellis::retry::{retry_with_backoff, RetryConfig};
//!
//! let version = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(5),
//!     "apiserver_version",
//!     || async { client.apiserver_version().await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::Error;

/// Default number of in-place attempts for conflicting writes
pub const DEFAULT_CONFLICT_ATTEMPTS: u32 = 5;

/// Configuration for operations that may fail transiently.
///
/// Used by the scheduler to space out retries of failed reconciliations, and
/// for startup calls against the API server.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    #[serde(with = "duration_millis", rename = "initialDelayMs")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(with = "duration_millis", rename = "maxDelayMs")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Whether another attempt is allowed after `attempt` attempts have run
    pub fn allows_attempt_after(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }

    /// Backoff delay before attempt `attempt + 1`, without jitter
    ///
    /// `attempt` is 1-based: the delay after the first failure is `initial_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Backoff delay before attempt `attempt + 1`, with 0.5x to 1.5x jitter
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(self.base_delay(attempt).as_secs_f64() * jitter)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to retry
///
/// # Returns
/// The result of the operation, or the last error if max_attempts is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !config.allows_attempt_after(attempt) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = config.jittered_delay(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Execute a write that may hit an optimistic-concurrency conflict.
///
/// The operation receives the 1-based attempt number; attempts after the first
/// are expected to re-fetch the latest object and reapply their change.
/// Only [`Error::Conflict`] is retried, immediately and at most
/// `max_attempts` times in total. Any other error is returned as is.
pub async fn retry_on_conflict<F, Fut, T>(
    max_attempts: u32,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Conflicting write, re-fetching and retrying"
                );
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        "Conflict retries exhausted"
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast_config(5), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast_config(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_base_delay_grows_and_caps() {
        let config = RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.base_delay(1), Duration::from_millis(100));
        assert_eq!(config.base_delay(2), Duration::from_millis(200));
        assert_eq!(config.base_delay(3), Duration::from_millis(350));
        assert_eq!(config.base_delay(40), Duration::from_millis(350));
    }

    #[test]
    fn test_jittered_delay_stays_in_band() {
        let config = fast_config(0);
        for attempt in 1..5 {
            let base = config.base_delay(attempt).as_secs_f64();
            let jittered = config.jittered_delay(attempt).as_secs_f64();
            assert!(jittered >= base * 0.5 && jittered <= base * 1.5);
        }
    }

    #[test]
    fn test_allows_attempt_after() {
        assert!(RetryConfig::infinite().allows_attempt_after(1_000));
        let config = RetryConfig::with_max_attempts(3);
        assert!(config.allows_attempt_after(2));
        assert!(!config.allows_attempt_after(3));
    }

    #[test]
    fn test_deserializes_from_yaml_with_defaults() {
        let config: RetryConfig =
            serde_yaml::from_str("maxAttempts: 4\ninitialDelayMs: 250\n").unwrap();
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.initial_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_conflict_retried_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();

        let result = retry_on_conflict(5, "add finalizer", |attempt| {
            let a = a.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(Error::conflict("default/foo", "stale"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_conflict_retry_is_bounded() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();

        let result: Result<(), Error> = retry_on_conflict(2, "remove finalizer", |_| {
            let a = a.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(Error::conflict("default/foo", "stale"))
            }
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_conflict_errors_are_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();

        let result: Result<(), Error> = retry_on_conflict(5, "replace", |_| {
            let a = a.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(Error::internal("connection reset"))
            }
        })
        .await;

        assert!(!result.unwrap_err().is_conflict());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
