//! Bounded retry with exponential backoff.
//!
//! [`with_retry`] wraps an async operation and retries it while the error
//! reports itself transient. Permanent errors are returned immediately.
//!
//! # Backoff Strategy
//!
//! - Base delay doubles with each attempt: `initial_backoff * 2^attempt`
//! - Delay is capped at `max_backoff`
//! - Random jitter of 0–50% of the computed delay is added so that many
//!   connections failing together do not retry in lockstep

use std::{fmt::Display, future::Future, time::Duration};

use fail::fail_point;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ConnectError, CredentialFetchError};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Default upper bound on a single delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Errors that know whether a retry may help.
pub trait Transient: Display {
    /// Whether another attempt may succeed.
    fn is_transient(&self) -> bool;
}

impl Transient for CredentialFetchError {
    fn is_transient(&self) -> bool {
        CredentialFetchError::is_transient(self)
    }
}

impl Transient for ConnectError {
    fn is_transient(&self) -> bool {
        ConnectError::is_transient(self)
    }
}

/// Retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; `0` disables retrying.
    #[serde(default = "default_max_retries")]
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    #[builder(default = DEFAULT_INITIAL_BACKOFF)]
    pub initial_backoff: Duration,

    /// Upper bound on a single delay (before jitter).
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    #[builder(default = DEFAULT_MAX_BACKOFF)]
    pub max_backoff: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryConfig {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::builder().max_retries(0).build()
    }
}

/// Executes `operation`, retrying transient failures per `config`.
///
/// Returns the first success, the first permanent error, or the last
/// transient error once retries are exhausted.
#[tracing::instrument(skip(config, operation), fields(max_retries = config.max_retries))]
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "operation succeeded after retry",
                    );
                }
                return Ok(value);
            },
            Err(err) if err.is_transient() && attempt < config.max_retries => {
                let delay = compute_backoff(config, attempt);
                tracing::debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = config.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying after backoff",
                );
                fail_point!("retry-before-sleep");
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(err) => {
                if attempt > 0 && err.is_transient() {
                    tracing::warn!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        error = %err,
                        "retries exhausted",
                    );
                }
                return Err(err);
            },
        }
    }
}

/// Computes the delay before retry number `attempt + 1`.
pub(crate) fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.initial_backoff.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(config.max_backoff);

    // Add jitter: 0–50% of the computed delay
    let jitter_range = capped.as_millis() as u64 / 2;
    if jitter_range > 0 {
        let jitter = rand::rng().random_range(0..=jitter_range);
        capped + Duration::from_millis(jitter)
    } else {
        capped
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig::builder()
            .max_retries(max_retries)
            .initial_backoff(Duration::from_millis(1))
            .max_backoff(Duration::from_millis(4))
            .build()
    }

    #[test]
    fn test_compute_backoff_exponential() {
        let config = RetryConfig::builder()
            .max_retries(5)
            .initial_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_secs(10))
            .build();

        // Attempt 0: base = 100ms, jitter up to 50ms
        let d0 = compute_backoff(&config, 0);
        assert!(d0 >= Duration::from_millis(100) && d0 <= Duration::from_millis(150));

        // Attempt 3: base = 800ms, jitter up to 400ms
        let d3 = compute_backoff(&config, 3);
        assert!(d3 >= Duration::from_millis(800) && d3 <= Duration::from_millis(1200));
    }

    #[test]
    fn test_compute_backoff_capped() {
        let config = RetryConfig::builder()
            .initial_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(300))
            .build();

        let d = compute_backoff(&config, 10);
        assert!(d >= Duration::from_millis(300) && d <= Duration::from_millis(450));

        // Huge shift must not overflow
        let d = compute_backoff(&config, 64);
        assert!(d <= Duration::from_millis(450));
    }

    #[test]
    fn test_no_retry_policy() {
        assert_eq!(RetryConfig::no_retry().max_retries, 0);
        assert_eq!(RetryConfig::default().max_retries, DEFAULT_MAX_RETRIES);
    }

    #[tokio::test]
    async fn test_transient_error_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, CredentialFetchError> = with_retry(&fast(3), "test", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err(CredentialFetchError::Status { status: 503 }) } else { Ok(n) }
        })
        .await;

        assert_eq!(result.expect("eventually succeeds"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), CredentialFetchError> = with_retry(&fast(5), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CredentialFetchError::invalid_response("garbage"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ConnectError> = with_retry(&fast(2), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ConnectError::Credential(CredentialFetchError::Status { status: 500 }))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3, "one attempt plus two retries");
    }

    #[tokio::test]
    async fn test_zero_retries_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), CredentialFetchError> = with_retry(&fast(0), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CredentialFetchError::Status { status: 503 })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_config_deserialization_with_humantime() {
        let config: RetryConfig =
            serde_json::from_str(r#"{ "max_retries": 1, "initial_backoff": "250ms" }"#)
                .expect("valid config");
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.initial_backoff, Duration::from_millis(250));
        assert_eq!(config.max_backoff, DEFAULT_MAX_BACKOFF);
    }
}
