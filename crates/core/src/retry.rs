//! Retry policy shared by every network operation of a run.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::RegistryError;

/// How often and how patiently a failed call is retried.
///
/// `max_retries` counts retries after the first attempt, so a call is
/// attempted at most `max_retries + 1` times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,

    /// Delay before the first retry, doubled after each failure.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for the doubled delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Errors that know whether another attempt is worthwhile.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for RegistryError {
    fn is_retryable(&self) -> bool {
        RegistryError::is_retryable(self)
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy is
/// exhausted. The last error is returned on exhaustion.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts();
    let mut delay = policy.initial_delay();
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && err.is_retryable() => {
                warn!(
                    what,
                    attempt,
                    max_attempts,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay.saturating_mul(2), policy.max_delay());
                attempt += 1;
            }
            Err(err) => {
                debug!(what, attempt, error = %err, "giving up");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_delay(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    fn transient() -> RegistryError {
        RegistryError::CommandFailed {
            exit_code: 1,
            stderr: "i/o timeout".into(),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = AtomicU32::new(0);

        let result = retry_with_backoff(&no_delay(3), "copy", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(transient())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_returns_last_error() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), RegistryError> = retry_with_backoff(&no_delay(2), "copy", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                Err(RegistryError::CommandFailed {
                    exit_code: n as i32,
                    stderr: format!("attempt {}", n),
                })
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err().to_string(), "command failed (exit 3): attempt 3");
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), RegistryError> = retry_with_backoff(&no_delay(5), "inspect", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(RegistryError::InvalidReference("::".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: 4,
            initial_delay_ms: 1_000,
            max_delay_ms: 2_500,
        };
        let start = tokio::time::Instant::now();

        let _: Result<(), RegistryError> =
            retry_with_backoff(&policy, "copy", || async { Err(transient()) }).await;

        // 1s + 2s + 2.5s + 2.5s
        assert_eq!(start.elapsed(), Duration::from_millis(8_000));
    }

    #[test]
    fn test_default_policy_is_single_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(RetryPolicy::with_retries(3).max_attempts(), 4);
    }
}
