//! Injectable clock.
//!
//! All time-dependent logic — routing windows, budget scans, retry delays,
//! idle timers — reads the current time and sleeps through this trait so
//! tests can pin the hour and skip real waiting.

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use std::time::Duration;

/// Clock seam: wall-clock time, local hour of day, and timer sleeps.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Local hour of day, 0–23. Used by peak-hours routing.
    fn hour_of_day(&self) -> u32;

    /// Suspend the caller for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by chrono and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn hour_of_day(&self) -> u32 {
        chrono::Local::now().hour()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually pinned clock for tests.
///
/// `sleep` returns immediately while recording the total requested wait,
/// so retry/backoff schedules can be asserted without real delays.
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
    hour: std::sync::Mutex<u32>,
    slept: std::sync::Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock pinned to the given instant and hour.
    pub fn new(now: DateTime<Utc>, hour: u32) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
            hour: std::sync::Mutex::new(hour),
            slept: std::sync::Mutex::new(Duration::ZERO),
        }
    }

    /// Re-pin the current instant.
    pub fn set_now(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    /// Re-pin the local hour.
    pub fn set_hour(&self, hour: u32) {
        if let Ok(mut guard) = self.hour.lock() {
            *guard = hour % 24;
        }
    }

    /// Total duration requested across all `sleep` calls.
    pub fn total_slept(&self) -> Duration {
        self.slept.lock().map(|d| *d).unwrap_or(Duration::ZERO)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now(), 12)
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|g| *g).unwrap_or_else(|_| Utc::now())
    }

    fn hour_of_day(&self) -> u32 {
        self.hour.lock().map(|g| *g).unwrap_or(12)
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut guard) = self.slept.lock() {
            *guard += duration;
        }
        // Yield once so spawned tasks interleave deterministically.
        tokio::task::yield_now().await;
    }
}
