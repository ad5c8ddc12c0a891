//! Retry with exponential backoff and jitter.
//!
//! [`RetryPolicy`] describes the schedule; [`retry_with_backoff`] drives any
//! fallible async operation through it, using a caller-supplied classifier to
//! decide which errors are worth another attempt. The job queue reuses the same
//! policy type to schedule job-level retries.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Backoff schedule: `base_delay * 2^(attempt - 1)`, plus up to
/// `jitter * delay` of random spread, never above `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Fraction of the delay added as random spread (0.0 disables jitter)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Set the jitter fraction (builder style)
    pub fn with_jitter(self, jitter: f64) -> Self {
        Self {
            jitter: jitter.clamp(0.0, 1.0),
            ..self
        }
    }

    /// Deterministic part of the delay after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay after failed attempt number `attempt`, including jitter.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = delay.mul_f64(self.jitter * jitter_fraction());
        (delay + spread).min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

static JITTER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Pseudo-random value in `[0, 1)`, derived from the clock and a process-wide counter.
fn jitter_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let counter = JITTER_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = blake3::Hasher::new();
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&counter.to_le_bytes());
    let hash = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

/// Runs `operation` until it succeeds, returns a non-retryable error, or the
/// policy's attempts are used up. The closure receives the 1-based attempt
/// number. The last error is returned unchanged.
pub async fn retry_with_backoff<T, E, Op, Fut, C>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: C,
    mut operation: Op,
) -> std::result::Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    C: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                let delay = policy.jittered_delay(attempt);
                tracing::debug!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation_name,
                    attempt,
                    max_attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    tracing::warn!(
                        "{} failed after {} attempts: {}",
                        operation_name,
                        attempt,
                        e
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(100), Duration::from_millis(500))
    }

    #[test]
    fn test_delays_double_and_cap() {
        let p = policy();
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(p.delay_for_attempt(60), Duration::from_millis(500));
    }

    #[test]
    fn test_delays_are_monotonic() {
        let p = RetryPolicy::new(20, Duration::from_millis(250), Duration::from_secs(60));
        let delays: Vec<_> = (1..20).map(|a| p.delay_for_attempt(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = policy().with_jitter(0.5);
        for attempt in 1..6 {
            let base = p.delay_for_attempt(attempt);
            for _ in 0..50 {
                let d = p.jittered_delay(attempt);
                assert!(d >= base);
                assert!(d <= p.max_delay);
                assert!(d <= base.mul_f64(1.5) + Duration::from_nanos(1));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(&policy(), "op", |_| true, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(format!("fail {attempt}"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(&policy(), "op", |_| true, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("down".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> =
            retry_with_backoff(&policy(), "op", |e: &String| e != "permanent", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent".to_string()) }
            })
            .await;
        assert_eq!(result, Err("permanent".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
