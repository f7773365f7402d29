//! Time source and owned timers.
//!
//! Nothing in duet-core sleeps or spawns. Components own [`Deadline`] and
//! [`Interval`] values and check them from a `tick()` method, reading the
//! time from an injected [`Clock`]. Tests substitute [`ManualClock`] and
//! step time forward explicitly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use web_time::{SystemTime, UNIX_EPOCH};

/// Source of the current time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(start_ms),
        })
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// One-shot timer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deadline {
    due_at: Option<u64>,
}

impl Deadline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer to fire `delay` after `now_ms`.
    pub fn arm(&mut self, now_ms: u64, delay: Duration) {
        self.due_at = Some(now_ms + delay.as_millis() as u64);
    }

    pub fn cancel(&mut self) {
        self.due_at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.due_at.is_some()
    }

    pub fn due_at(&self) -> Option<u64> {
        self.due_at
    }

    /// Returns true exactly once when the deadline has passed, then disarms.
    pub fn fire(&mut self, now_ms: u64) -> bool {
        match self.due_at {
            Some(due) if now_ms >= due => {
                self.due_at = None;
                true
            }
            _ => false,
        }
    }
}

/// Repeating timer with a fixed period.
///
/// Missed periods are not replayed: after a late `fire`, the next firing is
/// one full period after the late one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    period: Duration,
    next_at: Option<u64>,
}

impl Interval {
    /// Create a stopped interval.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_at: None,
        }
    }

    /// Start ticking; the first firing is one period after `now_ms`.
    pub fn start(&mut self, now_ms: u64) {
        self.next_at = Some(now_ms + self.period.as_millis() as u64);
    }

    pub fn stop(&mut self) {
        self.next_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_at.is_some()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn fire(&mut self, now_ms: u64) -> bool {
        match self.next_at {
            Some(next) if now_ms >= next => {
                self.next_at = Some(now_ms + self.period.as_millis() as u64);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_ms(), 1_250);
        clock.set(5);
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }

    // ==================== Deadline ====================

    #[test]
    fn test_deadline_fires_once() {
        let mut deadline = Deadline::new();
        deadline.arm(1_000, Duration::from_millis(500));

        assert!(!deadline.fire(1_499));
        assert!(deadline.fire(1_500));
        assert!(!deadline.fire(1_600));
        assert!(!deadline.is_armed());
    }

    #[test]
    fn test_deadline_cancel() {
        let mut deadline = Deadline::new();
        deadline.arm(0, Duration::from_secs(2));
        deadline.cancel();
        assert!(!deadline.fire(10_000));
    }

    #[test]
    fn test_unarmed_deadline_never_fires() {
        let mut deadline = Deadline::new();
        assert!(!deadline.fire(u64::MAX));
    }

    // ==================== Interval ====================

    #[test]
    fn test_interval_repeats() {
        let mut interval = Interval::new(Duration::from_secs(10));
        interval.start(0);

        assert!(!interval.fire(9_999));
        assert!(interval.fire(10_000));
        assert!(!interval.fire(15_000));
        assert!(interval.fire(20_000));
    }

    #[test]
    fn test_interval_does_not_replay_missed_periods() {
        let mut interval = Interval::new(Duration::from_secs(10));
        interval.start(0);

        assert!(interval.fire(45_000));
        assert!(!interval.fire(50_000));
        assert!(interval.fire(55_000));
    }

    #[test]
    fn test_stopped_interval_is_silent() {
        let mut interval = Interval::new(Duration::from_secs(1));
        assert!(!interval.fire(5_000));
        interval.start(0);
        interval.stop();
        assert!(!interval.fire(5_000));
        assert!(!interval.is_running());
    }
}
