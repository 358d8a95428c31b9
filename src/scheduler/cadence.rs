//! Drift-corrected schedule for one check.

use std::time::Duration;
use tokio::time::Instant;

/// Longest remaining wait that still counts as falling behind.
const MAX_RESYNC_THRESHOLD: Duration = Duration::from_secs(1);

/// What the check loop should do after a possible fire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Wait {
    /// Sleep this long until the next probe is due.
    Sleep(Duration),
    /// The schedule fell behind by this many seconds (negative means only
    /// a sliver of time was left) and has been reset to fire now.
    Behind(f64),
}

/// Absolute schedule: probes are due at `start`, `start + interval`, ...
/// regardless of how long each probe takes.
#[derive(Debug, Clone)]
pub struct Cadence {
    interval: Duration,
    next_due: Instant,
}

impl Cadence {
    /// A schedule whose first probe is due at `now`.
    pub fn new(now: Instant, interval: Duration) -> Self {
        Self {
            interval,
            next_due: now,
        }
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    /// Move to the next slot after firing.
    pub fn advance(&mut self) {
        self.next_due += self.interval;
    }

    /// Remaining wait below which the loop resynchronizes instead of sleeping.
    pub fn threshold(&self) -> Duration {
        MAX_RESYNC_THRESHOLD.min(self.interval / 2)
    }

    /// Decide how long to sleep, resynchronizing to `now` when behind.
    ///
    /// Catching up on missed slots would fire several probes back to back,
    /// so a late schedule is reset instead.
    pub fn wait(&mut self, now: Instant) -> Wait {
        match self.next_due.checked_duration_since(now) {
            Some(remaining) if remaining >= self.threshold() => Wait::Sleep(remaining),
            remaining => {
                let slack = match remaining {
                    Some(d) => d.as_secs_f64(),
                    None => -now.duration_since(self.next_due).as_secs_f64(),
                };
                self.next_due = now;
                Wait::Behind(slack)
            }
        }
    }
}
