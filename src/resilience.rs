//! Shared backoff and retry policies.
//!
//! The premium backend uses [`BackoffPolicy::reconnect`] between
//! reconnection attempts; the efficient backend wraps each REST stage in
//! [`with_retry`] with [`BackoffPolicy::rest_stage`]. Both read delays
//! through the injected [`Clock`], so tests run without real waiting.

use crate::clock::Clock;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff schedule with optional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Factor applied per subsequent attempt.
    pub multiplier: f64,
    /// Upper bound for any single delay (pre-jitter).
    pub max_delay: Duration,
    /// Maximum number of retries after the initial attempt.
    pub max_attempts: u32,
    /// Symmetric jitter fraction, e.g. `0.2` for ±20 %.
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Streaming transport reconnection: 1 s start, ×2, 30 s cap, 5 attempts.
    pub fn reconnect() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
            jitter: 0.0,
        }
    }

    /// REST stage retry: 1 s start, ×2, 10 s cap, 3 retries, ±20 % jitter.
    pub fn rest_stage() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10_000),
            max_attempts: 3,
            jitter: 0.2,
        }
    }

    /// Delay before the given 1-based attempt, capped and jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Upper bound on total wait across every scheduled attempt.
    pub fn max_total_wait(&self) -> Duration {
        self.max_delay * self.max_attempts
    }
}

/// Run `op`, retrying transient failures per `policy`.
///
/// `classify` decides whether an error is worth retrying; non-retryable
/// errors propagate immediately. `on_retry(attempt, delay)` fires before
/// each scheduled wait so callers can surface retry telemetry.
pub async fn with_retry<T, E, F, Fut>(
    clock: &dyn Clock,
    policy: &BackoffPolicy,
    classify: impl Fn(&E) -> bool,
    mut on_retry: impl FnMut(u32, Duration),
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt > policy.max_attempts || !classify(&err) {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                on_retry(attempt, delay);
                clock.sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn reconnect_schedule_doubles_and_caps() {
        let policy = BackoffPolicy::reconnect();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(8_000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(16_000));
        // Past the cap.
        assert_eq!(policy.delay_for(7), Duration::from_millis(30_000));
    }

    #[test]
    fn rest_stage_jitter_stays_within_twenty_pct() {
        let policy = BackoffPolicy::rest_stage();
        for _ in 0..50 {
            let ms = policy.delay_for(1).as_millis() as f64;
            assert!((800.0..=1_200.0).contains(&ms), "delay {ms} out of band");
        }
    }

    #[test]
    fn total_wait_is_bounded() {
        let policy = BackoffPolicy::reconnect();
        let mut total = Duration::ZERO;
        for attempt in 1..=policy.max_attempts {
            total += policy.delay_for(attempt);
        }
        assert!(total <= policy.max_total_wait());
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let clock = ManualClock::default();
        let policy = BackoffPolicy::rest_stage();
        let calls = AtomicU32::new(0);

        let result: Result<u32, &str> = with_retry(
            &clock,
            &policy,
            |_| true,
            |_, _| {},
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err("transient") } else { Ok(42) } }
            },
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(clock.total_slept() >= Duration::from_millis(1_600));
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_immediately() {
        let clock = ManualClock::default();
        let policy = BackoffPolicy::rest_stage();
        let calls = AtomicU32::new(0);

        let result: Result<u32, &str> = with_retry(
            &clock,
            &policy,
            |e| *e != "permanent",
            |_, _| {},
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent") }
            },
        )
        .await;

        assert_eq!(result, Err("permanent"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(clock.total_slept(), Duration::ZERO);
    }

    #[tokio::test]
    async fn retry_budget_exhausts() {
        let clock = ManualClock::default();
        let policy = BackoffPolicy::rest_stage();
        let calls = AtomicU32::new(0);

        let result: Result<u32, &str> = with_retry(
            &clock,
            &policy,
            |_| true,
            |_, _| {},
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("still failing") }
            },
        )
        .await;

        assert_eq!(result, Err("still failing"));
        // Initial attempt + 3 retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn on_retry_reports_attempt_and_delay() {
        let clock = ManualClock::default();
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::rest_stage()
        };
        let seen: Mutex<Vec<(u32, Duration)>> = Mutex::new(Vec::new());

        let _result: Result<u32, &str> = with_retry(
            &clock,
            &policy,
            |_| true,
            |attempt, delay| {
                if let Ok(mut v) = seen.lock() {
                    v.push((attempt, delay));
                }
            },
            || async { Err("nope") },
        )
        .await;

        let seen = seen.into_inner().unwrap_or_default();
        assert_eq!(
            seen,
            vec![
                (1, Duration::from_millis(1_000)),
                (2, Duration::from_millis(2_000)),
                (3, Duration::from_millis(4_000)),
            ]
        );
    }
}
