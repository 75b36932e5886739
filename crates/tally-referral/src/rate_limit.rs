//! Fixed-window attempt limiter
//!
//! Counts code redemption attempts per user. Windows are driven by the
//! injected clock so tests can step through them.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tally_core::clock::Clock;
use tally_core::error::{Result, TallyError};
use tally_core::types::UserId;

/// Expired windows are swept on every this-many checks
const SWEEP_EVERY: u64 = 256;

struct Window {
    opened_at: DateTime<Utc>,
    attempts: u32,
}

/// Per-user attempt limiter
pub struct AttemptLimiter {
    max_attempts: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
    windows: DashMap<UserId, Window>,
    checks: AtomicU64,
}

impl AttemptLimiter {
    pub fn new(max_attempts: u32, window_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_attempts,
            window: Duration::seconds(i64::try_from(window_secs).unwrap_or(i64::MAX / 1000)),
            clock,
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    /// Count one attempt, failing with `RateLimited` once the window is spent
    pub fn check(&self, user_id: &UserId) -> Result<()> {
        if (self.checks.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            self.sweep_expired();
        }
        let now = self.clock.now();
        let mut window = self.windows.entry(user_id.clone()).or_insert_with(|| Window {
            opened_at: now,
            attempts: 0,
        });

        if now - window.opened_at >= self.window {
            window.opened_at = now;
            window.attempts = 0;
        }

        if window.attempts >= self.max_attempts {
            let retry_after = (window.opened_at + self.window - now).num_seconds().max(1);
            return Err(TallyError::RateLimited {
                retry_after_secs: retry_after as u64,
            });
        }

        window.attempts += 1;
        Ok(())
    }

    /// Drop windows that have run out; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, w| now - w.opened_at < self.window);
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            tracing::debug!(removed, "Swept expired attempt windows");
        }
        removed
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    /// Attempts left in the current window
    pub fn remaining(&self, user_id: &UserId) -> u32 {
        let now = self.clock.now();
        self.windows
            .get(user_id)
            .filter(|w| now - w.opened_at < self.window)
            .map(|w| self.max_attempts.saturating_sub(w.attempts))
            .unwrap_or(self.max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tally_core::clock::ManualClock;

    #[test]
    fn test_limits_and_resets() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let limiter = AttemptLimiter::new(5, 3600, clock.clone());
        let user = UserId::new("alice");

        for _ in 0..5 {
            limiter.check(&user).unwrap();
        }
        assert_eq!(limiter.remaining(&user), 0);

        clock.advance(Duration::minutes(10));
        match limiter.check(&user) {
            Err(TallyError::RateLimited { retry_after_secs }) => assert_eq!(retry_after_secs, 3000),
            other => panic!("expected rate limit, got {other:?}"),
        }

        // Other users are unaffected
        limiter.check(&UserId::new("bob")).unwrap();

        clock.advance(Duration::minutes(50));
        limiter.check(&user).unwrap();
        assert_eq!(limiter.remaining(&user), 4);
    }

    #[test]
    fn test_expired_windows_are_swept() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let limiter = AttemptLimiter::new(5, 3600, clock.clone());
        for i in 0..10 {
            limiter.check(&UserId::new(format!("user{i}"))).unwrap();
        }
        assert_eq!(limiter.tracked(), 10);

        clock.advance(Duration::minutes(30));
        limiter.check(&UserId::new("late")).unwrap();
        assert_eq!(limiter.sweep_expired(), 0);

        clock.advance(Duration::minutes(31));
        assert_eq!(limiter.sweep_expired(), 10);
        assert_eq!(limiter.tracked(), 1);
        assert_eq!(limiter.remaining(&UserId::new("late")), 4);
    }

    #[test]
    fn test_checks_trigger_periodic_sweep() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let limiter = AttemptLimiter::new(5, 60, clock.clone());
        for i in 0..(SWEEP_EVERY - 1) {
            limiter.check(&UserId::new(format!("user{i}"))).unwrap();
        }
        clock.advance(Duration::minutes(2));
        limiter.check(&UserId::new("trigger")).unwrap();
        assert_eq!(limiter.tracked(), 1);
    }
}
