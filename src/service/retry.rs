//! Exponential backoff retry for transient failures.
//!
//! Whether an error is worth retrying is decided by `AppError::is_retryable`
//! alone. Non-retryable errors propagate immediately.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Initial delay in seconds.
    pub base_delay: f64,
    /// Delay cap in seconds.
    pub max_delay: f64,
    pub exponential_base: f64,
    /// Multiply the delay by uniform(0.75, 1.25) to avoid thundering herds.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: 1.0,
            max_delay: 60.0,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after the given 0-indexed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> f64 {
        let mut delay = self.base_delay * self.exponential_base.powi(attempt as i32);
        delay = delay.min(self.max_delay);
        if self.jitter {
            delay *= rand::thread_rng().gen_range(0.75..1.25);
        }
        delay
    }
}

/// Run `operation` until it succeeds, a non-retryable error occurs, or the
/// retry budget is spent. The last error propagates on exhaustion.
pub async fn retry_with_backoff<T, F, Fut>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                log::warn!(
                    "{} failed (attempt {}/{}), retrying in {:.2}s: {}",
                    operation_name,
                    attempt + 1,
                    config.max_retries,
                    delay,
                    err
                );
                last_error = Some(err);
                sleep(Duration::from_secs_f64(delay)).await;
            }
            Err(err) => {
                if err.is_retryable() {
                    log::error!(
                        "{} exhausted {} retries: {}",
                        operation_name,
                        config.max_retries,
                        err
                    );
                }
                return Err(err);
            }
        }
    }

    // Unreachable: the loop always returns. Kept for the type checker.
    Err(last_error.expect("retry loop exited without an error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn delay_grows_exponentially() {
        let config = no_jitter();
        assert_eq!(config.delay_for_attempt(0), 1.0);
        assert_eq!(config.delay_for_attempt(1), 2.0);
        assert_eq!(config.delay_for_attempt(2), 4.0);
    }

    #[test]
    fn delay_is_capped() {
        let config = no_jitter();
        assert_eq!(config.delay_for_attempt(10), 60.0);
    }

    #[test]
    fn jitter_stays_within_quarter() {
        let config = RetryConfig::default();
        for _ in 0..100 {
            let delay = config.delay_for_attempt(1);
            assert!(delay >= 2.0 * 0.75);
            assert!(delay < 2.0 * 1.25);
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let config = RetryConfig {
            base_delay: 0.001,
            jitter: false,
            ..RetryConfig::default()
        };

        let result = retry_with_backoff("test", &config, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AppError::network("flaky"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let attempts = AtomicU32::new(0);
        let config = RetryConfig {
            base_delay: 0.001,
            jitter: false,
            ..RetryConfig::default()
        };

        let result: Result<()> = retry_with_backoff("test", &config, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(AppError::HttpStatus {
                    service: "firecrawl",
                    status: 404,
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let attempts = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 2,
            base_delay: 0.001,
            jitter: false,
            ..RetryConfig::default()
        };

        let result: Result<()> = retry_with_backoff("test", &config, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::network("still down")) }
        })
        .await;

        assert!(matches!(result, Err(AppError::Network(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
