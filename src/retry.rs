//! Bounded retry with exponential backoff, jitter, and deadlines
//!
//! Transient failures during link establishment are retried inside the
//! `Connecting` state rather than surfaced to callers. The loop here is
//! explicitly bounded: a maximum attempt count and a monotonic deadline
//! both cap it, so cancellation and timeout compose trivially - there is
//! no open-ended recursion anywhere in the retry path.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::warn;

/// Configuration for operations that may fail transiently
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
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
}

/// Execute an async operation with backoff until it succeeds, the
/// attempt budget is spent, or the deadline passes
///
/// The deadline is checked before every sleep: if the jittered delay
/// would overrun it, the loop stops immediately and returns the last
/// error instead of sleeping past the caller's budget. The operation
/// itself is not cancelled mid-flight; callers that need that wrap the
/// whole call in `tokio::time::timeout`.
///
/// # Arguments
/// * `config` - Retry configuration
/// * `deadline` - Monotonic instant after which no further attempt starts
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to retry
pub async fn retry_until<F, Fut, T, E>(
    config: &RetryConfig,
    deadline: Instant,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max attempts"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                let now = Instant::now();
                if now >= deadline || now + jittered >= deadline {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Deadline reached, abandoning retries"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn succeeds_immediately() {
        let result: Result<i32, &str> =
            retry_until(&fast_config(3), far_deadline(), "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> =
            retry_until(&fast_config(5), far_deadline(), "op", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("connection refused")
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> =
            retry_until(&fast_config(3), far_deadline(), "op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("always fails")
                }
            })
            .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_at_deadline_instead_of_sleeping_past_it() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 1000,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 1.0,
        };
        // Deadline shorter than a single backoff sleep
        let deadline = Instant::now() + Duration::from_millis(10);

        let started = Instant::now();
        let result: Result<i32, &str> = retry_until(&config, deadline, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("unreachable")
            }
        })
        .await;

        assert_eq!(result, Err("unreachable"));
        // Gave up after the first attempt rather than burning the budget
        assert!(count.load(Ordering::SeqCst) <= 2);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn expired_deadline_still_allows_one_attempt() {
        // An attempt already in our hands is cheaper than a wasted call:
        // the first try always runs, only sleeps are deadline-gated.
        let deadline = Instant::now() - Duration::from_secs(1);
        let result: Result<i32, &str> =
            retry_until(&fast_config(5), deadline, "op", || async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }
}
