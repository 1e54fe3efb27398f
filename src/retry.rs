//! Retry and backoff helpers
//!
//! Provider calls that fail transiently (throttling, 5xx, per-call timeouts)
//! are retried with jittered exponential backoff. Anything else is returned
//! to the caller on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::error::Result;

/// Configuration for retrying transient provider failures
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(20),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self::with_max_attempts(1)
    }
}

/// Run `operation`, retrying only while it fails with a transient error.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jittered_delay = jitter(delay);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis() as u64,
                    "Transient failure, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Scale a delay by a random factor in 0.5x..1.5x
fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Calculate exponential backoff for polling
///
/// `base * 2^attempt`, capped at `max`. The exponent stops growing after
/// six doublings so the multiplication cannot overflow.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.min(6));
    base.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_secs(15);
        let max = Duration::from_secs(300);
        assert_eq!(calculate_backoff(0, base, max), Duration::from_secs(15));
        assert_eq!(calculate_backoff(1, base, max), Duration::from_secs(30));
        assert_eq!(calculate_backoff(2, base, max), Duration::from_secs(60));
        assert_eq!(calculate_backoff(3, base, max), Duration::from_secs(120));
        assert_eq!(calculate_backoff(4, base, max), Duration::from_secs(240));
        // capped at max
        assert_eq!(calculate_backoff(5, base, max), Duration::from_secs(300));
        assert_eq!(calculate_backoff(40, base, max), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = retry_transient(&fast_config(5), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Throttled("rate exceeded".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(assert_ok!(result), 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = retry_transient(&fast_config(5), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::Rejected("invalid subnets".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Rejected(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = retry_transient(&fast_config(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::ProviderUnavailable("503".into()))
            }
        })
        .await;

        let err = assert_err!(result);
        assert!(matches!(err, Error::ProviderUnavailable(_)));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
