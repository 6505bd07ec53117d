use std::fmt;

use parking_lot::Mutex;
use time::{Duration, OffsetDateTime};

/// Source of wall-clock time for debounce deadlines, snapshot intervals and
/// trash retention.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::new(datetime!(2026-01-05 09:00 UTC));
        assert_eq!(clock.now(), datetime!(2026-01-05 09:00 UTC));
        clock.advance(Duration::milliseconds(2500));
        assert_eq!(clock.now(), datetime!(2026-01-05 09:00:02.5 UTC));
    }
}
