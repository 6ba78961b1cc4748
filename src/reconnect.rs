use std::time::Duration;

/// Backoff and attempt bookkeeping for reconnect scheduling. Pure state,
/// no I/O; the connection manager arms the actual timer.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempts: u32,
    base: Duration,
    max: Duration,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            attempts: 0,
            base,
            max,
        }
    }

    /// Record one failed connection attempt.
    pub fn record_failure(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Reset after a successful open. The next failure starts the backoff
    /// over at the base delay.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt: base times the failure count, capped.
    /// Non-decreasing across consecutive failures until the cap.
    pub fn delay(&self) -> Duration {
        self.base.saturating_mul(self.attempts.max(1)).min(self.max)
    }
}
