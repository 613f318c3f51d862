//! Reusable retry policy with exponential backoff and bounded jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Describes how an operation should be retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the computed delay, before jitter.
    pub max_delay: Duration,
    /// Jitter fraction applied symmetrically (0.25 = plus or minus 25%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(60_000),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base_delay, self.max_delay, self.jitter)
    }

    /// Run `op` up to `max_attempts` times, sleeping the backoff between
    /// attempts. Errors for which `is_retryable` returns false abort
    /// immediately.
    pub async fn run<T, E, F, Fut, R>(&self, is_retryable: R, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && is_retryable(&err) => {
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// `min(base * 2^retry_count, max)`, jittered by the given fraction.
///
/// The clamp applies before jitter, so the result never exceeds
/// `max * (1 + jitter)`.
pub fn calculate_backoff(
    retry_count: u32,
    base: Duration,
    max: Duration,
    jitter: f64,
) -> Duration {
    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;

    let multiplier = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    let capped = base_ms.saturating_mul(multiplier).min(max_ms);

    let factor = if jitter > 0.0 {
        1.0 + rand::rng().random_range(-jitter..=jitter)
    } else {
        1.0
    };

    Duration::from_millis(((capped as f64) * factor).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_until_the_cap() {
        let base = Duration::from_millis(1_000);
        let max = Duration::from_millis(60_000);

        // No jitter makes the arithmetic exact.
        assert_eq!(calculate_backoff(0, base, max, 0.0), Duration::from_millis(1_000));
        assert_eq!(calculate_backoff(1, base, max, 0.0), Duration::from_millis(2_000));
        assert_eq!(calculate_backoff(3, base, max, 0.0), Duration::from_millis(8_000));
        assert_eq!(calculate_backoff(6, base, max, 0.0), Duration::from_millis(60_000));
    }

    #[test]
    fn backoff_respects_cap_plus_jitter() {
        let base = Duration::from_millis(1_000);
        let max = Duration::from_millis(5_000);
        for _ in 0..100 {
            let d = calculate_backoff(10, base, max, 0.25);
            assert!(d <= Duration::from_millis(6_250), "got {d:?}");
            assert!(d >= Duration::from_millis(3_750), "got {d:?}");
        }
    }

    #[test]
    fn backoff_survives_huge_retry_counts() {
        let d = calculate_backoff(200, Duration::from_millis(1_000), Duration::from_millis(5_000), 0.0);
        assert_eq!(d, Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_until_success() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: 0.0,
        };

        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = policy
            .run(
                |_| true,
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { if n < 3 { Err("transient") } else { Ok(n) } }
                },
            )
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_aborts_on_non_retryable_error() {
        let policy = RetryPolicy::default();

        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = policy
            .run(
                |e: &&str| *e != "fatal",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("fatal") }
                },
            )
            .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
