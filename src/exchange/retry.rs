// =============================================================================
// Retry with exponential backoff and jitter
// =============================================================================
//
// Applied around every Exchange Port call. Only `ExchangeError::Transient`
// is retried; `Permanent` and `CircuitOpen` are returned immediately.

use rand::Rng;
use std::time::Duration;
use tracing::debug;

use super::ExchangeError;

/// Retry parameters. `max_attempts` includes the first attempt, so
/// `max_attempts = 3` means up to two retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay }
    }

    /// Run `call` with exponential backoff and jitter, retrying only on
    /// transient errors up to `max_attempts` total tries.
    pub async fn run<F, Fut, T>(&self, call: F) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ExchangeError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    debug!(attempt, ?delay, "transient exchange error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `base_delay * 2^(attempt-1)` with up to 50% positive jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        let base = self.base_delay.saturating_mul(exp);
        let jitter_fraction: f64 = rand::rng().random_range(0.0..0.5);
        base.mul_f64(1.0 + jitter_fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_first_try_without_sleeping() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<i32, ExchangeError> = policy
            .run(|| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<i32, ExchangeError> = policy
            .run(|| {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ExchangeError::Transient { message: "timeout".into() })
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<i32, ExchangeError> = policy
            .run(|| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(ExchangeError::Transient { message: "timeout".into() }) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<i32, ExchangeError> = policy
            .run(|| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(ExchangeError::Permanent { message: "bad symbol".into() }) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
