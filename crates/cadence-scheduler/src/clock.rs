use std::sync::Mutex;

use chrono::{DateTime, Duration, SubsecRound, Utc};

/// Source of "now" for every scheduling decision.
///
/// The engine never calls `Utc::now()` directly so tests can drive time by hand.
/// Both clocks hand out instants at storage precision, so a job built from
/// `now()` compares equal to the same job read back from the store.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Drop sub-microsecond precision; the store keeps microseconds.
pub fn truncate_micros(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.trunc_subsecs(6)
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_micros(Utc::now())
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(truncate_micros(start)),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = truncate_micros(to);
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = truncate_micros(*now + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn clocks_hand_out_storage_precision() {
        assert_eq!(SystemClock.now().nanosecond() % 1_000, 0);

        let start = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap() + Duration::nanoseconds(1_234_567);
        let clock = ManualClock::new(start);
        assert_eq!(clock.now().nanosecond(), 1_234_000);
        clock.advance(Duration::nanoseconds(999));
        assert_eq!(clock.now().nanosecond(), 1_234_000);
        clock.set(start + Duration::seconds(1));
        assert_eq!(clock.now().nanosecond(), 1_234_000);
    }
}
