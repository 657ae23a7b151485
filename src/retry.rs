//! Bounded retry with exponential backoff and jitter.
//!
//! Only errors the caller marks as retryable are retried. The webhook uses
//! this to rerun a Sidecar read-modify-write that lost a resourceVersion
//! race; every other store error is returned on the first failure.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Backoff settings for retryable operations.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (minimum 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
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

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::with_max_attempts(1)
    }
}

/// Run `operation` until it succeeds, fails with an error `retryable`
/// rejects, or `max_attempts` is exhausted.
///
/// Returns the last error when giving up.
pub async fn retry_while<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !retryable(&err) {
            debug!(operation = %operation_name, attempt, error = %err, "Operation failed, not retryable");
            return Err(err);
        }

        if attempt >= max_attempts {
            warn!(
                operation = %operation_name,
                attempt,
                error = %err,
                "Operation still conflicting after max retries"
            );
            return Err(err);
        }

        // 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = jittered_delay.as_millis(),
            "Operation conflicted, retrying"
        );

        tokio::time::sleep(jittered_delay).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}
