use time::{Duration, OffsetDateTime};

/// A single cancellable scheduled run.
///
/// Scheduling always replaces whatever was pending, so at most one deadline
/// exists at a time.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    due_at: Option<OffsetDateTime>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            due_at: None,
        }
    }

    /// Cancels any pending run and schedules a new one `delay` after `now`.
    pub fn schedule(&mut self, now: OffsetDateTime) -> OffsetDateTime {
        let due_at = now + self.delay;
        self.due_at = Some(due_at);
        due_at
    }

    /// Returns whether a run was pending.
    pub fn cancel(&mut self) -> bool {
        self.due_at.take().is_some()
    }

    pub fn is_scheduled(&self) -> bool {
        self.due_at.is_some()
    }

    pub fn due_at(&self) -> Option<OffsetDateTime> {
        self.due_at
    }

    /// Consumes the pending run once its deadline has passed.
    pub fn take_due(&mut self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        match self.due_at {
            Some(due_at) if now >= due_at => self.due_at.take(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn rescheduling_replaces_the_pending_deadline() {
        let t0 = datetime!(2026-01-05 09:00 UTC);
        let mut debouncer = Debouncer::new(Duration::seconds(2));

        debouncer.schedule(t0);
        let due = debouncer.schedule(t0 + Duration::seconds(1));
        assert_eq!(due, t0 + Duration::seconds(3));

        assert!(debouncer.take_due(t0 + Duration::seconds(2)).is_none());
        assert_eq!(debouncer.take_due(t0 + Duration::seconds(3)), Some(due));
        assert!(!debouncer.is_scheduled());
        assert!(debouncer.take_due(t0 + Duration::seconds(10)).is_none());
    }

    #[test]
    fn cancel_reports_whether_anything_was_pending() {
        let mut debouncer = Debouncer::new(Duration::seconds(2));
        assert!(!debouncer.cancel());
        debouncer.schedule(datetime!(2026-01-05 09:00 UTC));
        assert!(debouncer.cancel());
        assert!(debouncer.due_at().is_none());
    }
}
