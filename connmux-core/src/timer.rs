//! Timer driver: the single next wake-up deadline requested by the scheduler.

use std::time::{Duration, Instant};

/// Source of the current time. The host can substitute its own for deterministic runs.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wall clock backed by `Instant::now`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Holds at most one deadline. Every update overwrites the previous one.
#[derive(Debug, Default)]
pub struct TimerDriver {
    deadline: Option<Instant>,
}

impl TimerDriver {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// Replace the deadline. `None` means the host may block on sockets alone.
    /// Returns true if the stored deadline changed.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) -> bool {
        let changed = self.deadline != deadline;
        self.deadline = deadline;
        changed
    }

    /// Relative form of `set_deadline`.
    pub fn set_timeout(&mut self, now: Instant, after: Option<Duration>) -> bool {
        self.set_deadline(after.and_then(|d| now.checked_add(d)))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once `now` has reached the deadline. Never due without a deadline.
    pub fn due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if now >= d)
    }

    /// Time left until the deadline, zero if already due, `None` if no deadline is set.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }
}
