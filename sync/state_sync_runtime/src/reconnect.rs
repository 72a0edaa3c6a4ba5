//! Reconnect pacing for a lost transport.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    Now,
    After { delay_ms: u64 },
    /// Attempts are exhausted; the caller falls back to a full resync.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    interval_ms: u64,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, interval_ms: u64) -> Self {
        Self {
            max_attempts,
            interval_ms,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// First attempt is immediate, later ones wait one interval each.
    pub fn next_step(&mut self) -> ReconnectStep {
        self.attempt = self.attempt.saturating_add(1);

        if self.attempt > self.max_attempts {
            return ReconnectStep::GiveUp;
        }
        if self.attempt == 1 {
            return ReconnectStep::Now;
        }
        ReconnectStep::After {
            delay_ms: self.interval_ms,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
