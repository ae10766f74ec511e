//! Retry with exponential backoff for transport deliveries.
//!
//! Transports call [`retry_async`] with a [`RetryConfig`] derived from the
//! caller's `max_retries`: one initial attempt plus up to `max_retries`
//! retries, sleeping `min(base * 2^attempt, max)` plus a little jitter
//! between attempts.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub min_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 = none). The sleep is `delay * (1 + frac * jitter)`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            min_delay_ms: 25,
            max_delay_ms: 2_000,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// One attempt plus `max_retries` retries with the default delays.
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            ..Self::default()
        }
    }
}

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success {
        result: T,
        /// Total number of attempts made (1 = first try succeeded).
        attempts: u32,
    },
    Exhausted {
        /// The error from the last attempt.
        last_error: E,
        attempts: u32,
    },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Compute the delay before retry number `attempt` (0-indexed).
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config
        .min_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(config.max_delay_ms);
    if config.jitter <= 0.0 {
        return Duration::from_millis(capped);
    }
    let with_jitter = capped as f64 * (1.0 + jitter_fraction() * config.jitter);
    Duration::from_millis((with_jitter as u64).min(config.max_delay_ms))
}

/// Pseudo-random fraction in `[0, 1)` from the clock. Not for cryptography.
fn jitter_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let mixed = nanos.wrapping_mul(2654435761);
    (mixed as f64) / (u32::MAX as f64 + 1.0)
}

/// Run `operation` until it succeeds, `should_retry` rejects the error, or the
/// attempts run out.
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "Delivery succeeded after retry");
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt + 1,
                };
            }
            Err(err) => {
                let retryable = should_retry(&err);
                if attempt + 1 >= max || !retryable {
                    if retryable {
                        warn!(attempts = attempt + 1, error = %err, "All delivery attempts exhausted");
                    } else {
                        debug!(attempts = attempt + 1, error = %err, "Error is not retryable");
                    }
                    return RetryOutcome::Exhausted {
                        last_error: err,
                        attempts: attempt + 1,
                    };
                }
                let delay = compute_backoff(config, attempt);
                debug!(attempt = attempt + 1, ?delay, error = %err, "Retrying delivery");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
