//! Retry utilities with exponential backoff and jitter.
//!
//! Used for calls to out-of-process collaborators (SCI RPCs, cloud REST APIs)
//! where a transient failure should be absorbed before it becomes visible in
//! an object's status.
//!
//! # Example
//!
//! ```ignore
//! use kiln_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let md5 = retry_with_backoff(
//!     &RetryConfig::default(),
//!     "get_object_md5",
//!     |e: &SciError| e.is_transient(),
//!     || async { sci.get_object_md5(&bucket, &object).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to randomize delays (0.5x to 1.5x)
    pub jitter: bool,
}

impl Default for RetryConfig {
    /// Three attempts with a doubling 200ms base delay
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
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

    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(31) as i32);
        Duration::from_secs_f64(
            (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Execute an async operation with exponential backoff.
///
/// Only errors for which `should_retry` returns true are retried; anything
/// else is returned immediately. After `max_attempts` the last error is
/// returned.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts.max(1) {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let base = config.delay_for(attempt);
                let delay = if config.jitter {
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    Duration::from_secs_f64(base.as_secs_f64() * jitter)
                } else {
                    base
                };

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
