//! Consumer retry with exponential backoff
//!
//! Transient failures (connectivity, timeouts) are retried in place before a
//! message is given up on and dead-lettered. Permanent failures must not go
//! through here; they are classified by the consumer and dispatched
//! immediately.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Initial backoff duration, doubled after each failed attempt
    pub initial_backoff: Duration,
    /// Cap on the exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Retry a fallible async operation with exponential backoff.
///
/// Returns the first success, or the last error once `max_attempts` is
/// exhausted. The `context` string tags the retry logs.
///
/// # Example
/// ```rust
/// use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let config = RetryConfig::default();
/// let value = retry_with_backoff(
///     || async { Ok::<_, String>(42) },
///     &config,
///     "project_registration",
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Send,
{
    let mut backoff = config.initial_backoff;
    // A zero-attempt config would skip the loop entirely; treat it as one.
    let max_attempts = config.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(context, attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(
                    context,
                    attempts = attempt,
                    error = %e,
                    "Operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    context,
                    attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying with backoff"
                );
                sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, config.max_backoff);
            }
        }
    }

    // max_attempts >= 1 means the loop always returns before falling through
    unreachable!("retry loop exits via return")
}
