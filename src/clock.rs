//! Wall-clock abstractions used to decide whether a retry-after deadline is still active.

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use std::sync::{Arc, Mutex, PoisonError};

/// Clock abstraction so deadlines can be checked against a faked "now" in tests.
///
/// Implementations should return instants with at most microsecond precision, which is the
/// precision deadlines are serialized with.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock, truncated to microseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same instant, so a clock handed to the gate and to an
/// [`InMemoryCache`](crate::InMemoryCache) can be advanced from the test body.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start.trunc_subsecs(6))) }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = instant.trunc_subsecs(6);
    }

    /// Move the clock forward (or backward for negative deltas).
    pub fn advance(&self, delta: TimeDelta) {
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(next) = guard.checked_add_signed(delta) {
            *guard = next.trunc_subsecs(6);
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(SystemClock.now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn system_clock_has_microsecond_precision() {
        let now = SystemClock.now();
        assert_eq!(now.nanosecond() % 1_000, 0);
    }

    #[test]
    fn manual_clock_shares_state_between_clones() {
        let start = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();
        let clock = ManualClock::new(start);
        let other = clock.clone();

        other.advance(TimeDelta::microseconds(1));
        assert_eq!(clock.now(), start + TimeDelta::microseconds(1));

        clock.set(start);
        assert_eq!(other.now(), start);
    }

    #[test]
    fn manual_clock_drops_sub_microsecond_precision() {
        let start = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(TimeDelta::nanoseconds(1_500));
        assert_eq!(clock.now(), start + TimeDelta::microseconds(1));
    }
}
