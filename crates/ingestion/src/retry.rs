//! Bounded retry with exponential backoff and jitter.
//!
//! Only transport failures are retried. A malformed response is returned
//! immediately since asking again will not change its shape.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use swapshard_core::{Error, Result};
use tracing::warn;

/// Upper bound for a single delay.
const MAX_DELAY_MS: u64 = 30_000;

/// Exponential backoff retry policy.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Base delay in milliseconds.
    base_delay_ms: u64,
    /// Retries after the first attempt.
    max_retries: u32,
}

impl ExponentialBackoff {
    /// Create a new retry policy.
    pub fn new(base_delay_ms: u64, max_retries: u32) -> Self {
        Self {
            base_delay_ms,
            max_retries,
        }
    }

    /// Run `operation`, retrying transport errors.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(Error::Transport(msg)) if attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(Error::Transport(msg)) if self.max_retries > 0 => {
                    return Err(Error::transport(format!(
                        "giving up after {} attempts: {}",
                        self.max_retries + 1,
                        msg
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delay before retry number `attempt` (0-based), with ±10% jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        let jitter_range = exponential / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range * 2) as i64 - jitter_range as i64
        } else {
            0
        };
        let delay = (exponential as i64 + jitter).max(0) as u64;
        Duration::from_millis(delay.min(MAX_DELAY_MS))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(500, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_success_first_try() {
        let retry = ExponentialBackoff::new(1, 3);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = retry
            .execute(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(42)
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let retry = ExponentialBackoff::new(1, 3);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = retry
            .execute(|| async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Error::transport("503 Service Unavailable"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let retry = ExponentialBackoff::new(1, 2);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<()> = retry
            .execute(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::transport("connection reset"))
            })
            .await;

        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_malformed_response_not_retried() {
        let retry = ExponentialBackoff::new(1, 5);
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<()> = retry
            .execute(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::malformed("missing data.swaps"))
            })
            .await;

        assert!(matches!(result, Err(Error::MalformedResponse(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_growth() {
        let retry = ExponentialBackoff::new(100, 3);

        let d0 = retry.delay_for(0).as_millis();
        assert!((90..=110).contains(&d0));

        let d1 = retry.delay_for(1).as_millis();
        assert!((180..=220).contains(&d1));

        let d2 = retry.delay_for(2).as_millis();
        assert!((360..=440).contains(&d2));
    }

    #[test]
    fn test_delay_capped() {
        let retry = ExponentialBackoff::new(10_000, 10);
        assert_eq!(retry.delay_for(8).as_millis(), MAX_DELAY_MS as u128);
    }
}
