use crate::error::AdapterError;
use rand::Rng;
use std::future::Future;
use tokio::time::{sleep, Duration};

/// Bounded retry policy for exchange calls. Replaces ad-hoc retry loops:
/// one helper, explicit budget, composes with the rate limiter because the
/// retried operation re-acquires its permit on every attempt.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let mut delay = self.base_delay.mul_f64(multiplier).min(self.max_delay);
        if self.add_jitter {
            delay = delay.mul_f64(rand::thread_rng().gen_range(0.75..1.25));
        }
        delay
    }
}

/// Run `op` until it succeeds, returns a non-retryable error, or the
/// attempt budget runs out.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut op: F,
) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < config.max_attempts => {
                let delay = config.delay_for(attempt);
                tracing::warn!(
                    "{}: attempt {}/{} failed ({}), retrying in {:?}",
                    operation,
                    attempt + 1,
                    config.max_attempts,
                    err,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Exchange;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn throttled() -> AdapterError {
        AdapterError::Throttled {
            exchange: Exchange::Binance,
            operation: "test",
        }
    }

    fn not_found() -> AdapterError {
        AdapterError::NotFound {
            exchange: Exchange::Binance,
            operation: "test",
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result = with_retry(&RetryConfig::default(), "op", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(throttled())
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), _> = with_retry(&RetryConfig::default(), "op", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(throttled())
        })
        .await;

        assert!(matches!(result, Err(AdapterError::Throttled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), _> = with_retry(&RetryConfig::default(), "op", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(not_found())
        })
        .await;

        assert!(matches!(result, Err(AdapterError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry_config_is_single_attempt() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let result: Result<(), _> = with_retry(&RetryConfig::no_retry(), "op", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(throttled())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
