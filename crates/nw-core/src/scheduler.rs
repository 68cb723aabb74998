//! The tick scheduler: the main-thread timer that asks the worker to run.
//!
//! The scheduler starts disabled and is enabled when the bus reports
//! READY. It never sleeps on its own; the main loop asks for the next
//! deadline, waits on the bus with that timeout, and calls
//! [`TickScheduler::fire_due`] afterwards. The period is re-read from
//! configuration on every fire, so a changed statistics frequency takes
//! effect on the next tick.

use std::time::{Duration, Instant};
use tracing::debug;

/// Periodic tick source, driven by the main event loop.
#[derive(Debug)]
pub struct TickScheduler {
    next_fire: Option<Instant>,
}

impl TickScheduler {
    /// New scheduler, disabled until [`enable`](Self::enable).
    pub fn new() -> Self {
        Self { next_fire: None }
    }

    /// Enable ticking. The first tick fires immediately so a freshly
    /// started daemon gathers a baseline without waiting a full period.
    pub fn enable(&mut self, now: Instant) {
        if self.next_fire.is_none() {
            debug!("tick scheduler enabled");
            self.next_fire = Some(now);
        }
    }

    /// Disable ticking (during shutdown).
    pub fn disable(&mut self) {
        self.next_fire = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.next_fire.is_some()
    }

    /// How long the main loop may wait before the next tick is due.
    /// `None` while disabled.
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        self.next_fire
            .map(|at| at.saturating_duration_since(now))
    }

    /// Fire if due. `period` is the current statistics frequency; the
    /// next deadline advances by whole periods so slow runs do not make
    /// the schedule drift.
    pub fn fire_due(&mut self, now: Instant, period: Duration) -> bool {
        let Some(at) = self.next_fire else {
            return false;
        };
        if now < at {
            return false;
        }
        let mut next = at + period;
        // a long stall must not queue a burst of back-to-back ticks
        while next <= now {
            next += period;
        }
        self.next_fire = Some(next);
        true
    }
}

impl Default for TickScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_secs(60);

    #[test]
    fn test_disabled_never_fires() {
        let mut scheduler = TickScheduler::new();
        let now = Instant::now();
        assert!(!scheduler.is_enabled());
        assert_eq!(scheduler.timeout(now), None);
        assert!(!scheduler.fire_due(now, PERIOD));
    }

    #[test]
    fn test_first_fire_immediate_after_enable() {
        let mut scheduler = TickScheduler::new();
        let now = Instant::now();
        scheduler.enable(now);
        assert_eq!(scheduler.timeout(now), Some(Duration::ZERO));
        assert!(scheduler.fire_due(now, PERIOD));
        // next fire one period out
        assert!(!scheduler.fire_due(now, PERIOD));
        assert_eq!(scheduler.timeout(now), Some(PERIOD));
    }

    #[test]
    fn test_period_change_applies_next_fire() {
        let mut scheduler = TickScheduler::new();
        let start = Instant::now();
        scheduler.enable(start);
        assert!(scheduler.fire_due(start, PERIOD));

        // frequency raised to 2 minutes before the next fire
        let later = start + PERIOD;
        assert!(scheduler.fire_due(later, Duration::from_secs(120)));
        assert_eq!(scheduler.timeout(later), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_stall_does_not_burst() {
        let mut scheduler = TickScheduler::new();
        let start = Instant::now();
        scheduler.enable(start);
        assert!(scheduler.fire_due(start, PERIOD));

        // the loop was stuck for five periods; one fire, schedule realigned
        let later = start + 5 * PERIOD + Duration::from_secs(1);
        assert!(scheduler.fire_due(later, PERIOD));
        assert!(!scheduler.fire_due(later, PERIOD));
        let timeout = scheduler.timeout(later).unwrap();
        assert!(timeout <= PERIOD);
    }

    #[test]
    fn test_enable_twice_keeps_schedule() {
        let mut scheduler = TickScheduler::new();
        let start = Instant::now();
        scheduler.enable(start);
        assert!(scheduler.fire_due(start, PERIOD));
        scheduler.enable(start); // second READY is a no-op
        assert!(!scheduler.fire_due(start, PERIOD));
    }
}
