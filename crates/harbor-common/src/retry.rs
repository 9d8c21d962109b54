//! Retry and timeout utilities.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff schedule for repeated attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Add up to 25% jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Short delays, suitable for asset fetches during install.
    pub fn quick(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Calculate delay before a given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let base =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi((attempt - 2) as i32);
        let delay = Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()));

        if self.jitter {
            delay + Duration::from_secs_f64(delay.as_secs_f64() * rand_jitter() * 0.25)
        } else {
            delay
        }
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Cheap pseudo-random value in `0.0..=1.0` derived from the clock.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos as f64) / (u32::MAX as f64)
}

/// Retry a fallible async operation with exponential backoff.
///
/// `operation` receives the 1-indexed attempt number. The last error is
/// returned once `max_attempts` is exhausted.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) if config.allows_retry_after(attempt) => {
                let delay = config.delay_for_attempt(attempt + 1);
                warn!(attempt, max_attempts = config.max_attempts, error = %e, ?delay, "Attempt failed, retrying");
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(attempt, error = %e, "Giving up");
                return Err(e);
            }
        }
    }
}

/// Run a future with a timeout.
pub async fn with_timeout<T, Fut>(timeout: Duration, future: Fut) -> crate::Result<T>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| crate::HarborError::Timeout(timeout))
}
