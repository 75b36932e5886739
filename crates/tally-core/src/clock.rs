//! Wall-clock abstraction
//!
//! Season weeks, cooldown windows and decay all depend on "now". Components
//! take an `Arc<dyn Clock>` so tests can drive time explicitly.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real system time
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and offline replay
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.write() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// 1-based season week containing `at`, given the season start
pub fn week_of(start: DateTime<Utc>, at: DateTime<Utc>) -> u32 {
    let elapsed = (at - start).num_seconds().max(0);
    (elapsed / Duration::weeks(1).num_seconds()) as u32 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::days(3));
        assert_eq!(clock.now(), start + Duration::days(3));
    }

    #[test]
    fn test_week_of() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(week_of(start, start), 1);
        assert_eq!(week_of(start, start + Duration::days(6)), 1);
        assert_eq!(week_of(start, start + Duration::days(7)), 2);
        assert_eq!(week_of(start, start + Duration::days(64)), 10);
        // Clock skew before the start still lands in week 1
        assert_eq!(week_of(start, start - Duration::hours(1)), 1);
    }
}
