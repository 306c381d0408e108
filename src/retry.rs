//! Bounded fixed-delay retry
//!
//! The single failure-recovery primitive of the scraper. Real-IP resolution,
//! session creation and navigation all go through [`RetryPolicy::run`];
//! nothing else loops on its own.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

/// Retry configuration: how many attempts, and how long to sleep between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total number of attempts (the first call counts as attempt 1)
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with explicit attempt count and delay
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Run `op` until it returns `Ok`, retrying errors for which `retryable`
    /// holds. Sleeps [`delay`](Self::delay) between attempts. Once the
    /// attempt budget is spent, or on the first non-retryable error, the
    /// last error is returned to the caller.
    ///
    /// `op` receives the 1-based attempt number, mostly for logging.
    pub async fn run<T, E, Fut>(
        &self,
        mut op: impl FnMut(u32) -> Fut,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && retryable(&err) => {
                    warn!(
                        "attempt {}/{} failed: {}",
                        attempt, self.max_attempts, err
                    );
                    sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
