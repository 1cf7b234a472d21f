//! Periodic checks on wall clock time
//!
//! The wall clock may jump (suspend, NTP). A check is due when its time has
//! passed, or when the clock went back so far that waiting would take
//! much longer than one period.

use std::time::{SystemTime, UNIX_EPOCH};

/// Backward jump after which a check runs immediately
const MAX_BACKWARD_JUMP: i64 = 200;

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    next: u64,
    period: u64,
}

impl Schedule {
    pub fn new(now: u64, first_delay: u64, period: u64) -> Self {
        Self {
            next: now + first_delay,
            period: period.max(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next
    }

    pub fn is_due(&self, now: u64) -> bool {
        let ahead = self.next as i64 - now as i64;
        ahead < 0 || ahead > MAX_BACKWARD_JUMP
    }

    /// Next run one period from now
    pub fn reschedule(&mut self, now: u64) {
        self.next = now + self.period;
    }

    /// Next run at the first future slot keeping the original phase
    pub fn reschedule_aligned(&mut self, now: u64) {
        let mut next = (now / self.period) * self.period + self.next % self.period;
        if next <= now {
            next += self.period;
        }
        self.next = next;
    }
}
