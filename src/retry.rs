//! Bounded retry with exponential backoff for calls against throttled
//! external services. Only errors that classify themselves as transient are
//! retried; domain rejections go straight back to the caller.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Implemented by error types whose failures may be worth retrying.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts, base_delay }
    }

    /// Sleep before retry number `attempt` (zero-based): `base * 2^attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }

    /// Run `call` until it succeeds, fails permanently, or the attempt
    /// budget is spent. The last error is returned as-is, never swallowed.
    pub async fn execute<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        "{operation}: attempt {}/{} failed: {err}; retrying in {delay:?}",
                        attempt + 1,
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
