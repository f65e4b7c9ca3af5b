use std::time::Duration;

/// Exponential reconnect delay for the push channel.
///
/// Delays double from `base` up to `max`; `reset` is called once a connection
/// has been established so the next outage starts from `base` again.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base_ms = (base.as_millis() as u64).max(1);
        Self {
            base_ms,
            max_ms: (max.as_millis() as u64).max(base_ms),
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt; a server hint wins when it is longer.
    pub fn next_delay(&mut self, hint: Option<Duration>) -> Duration {
        let shift = self.attempt.min(20);
        let calculated = self.base_ms.saturating_mul(1_u64 << shift);
        let hinted = hint.map(|value| value.as_millis() as u64).unwrap_or(0);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(calculated.max(hinted).min(self.max_ms))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}
