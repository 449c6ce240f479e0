use std::time::Duration;

use tracing::warn;

/// Backoff settings for retried opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, the first one included. At least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt. Doubles for each attempt after.
    pub base_delay: Duration,
    /// Upper bound on the doubled delay.
    pub max_delay: Duration,
    /// Random extra delay (0–max) added to every sleep so players kicked
    /// by the same outage don't all retry in lockstep.
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl RetryConfig {
    /// A config that tries once and never sleeps.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Clamp and fix any out-of-range values so the config is safe to use.
    ///
    /// Called automatically by [`RetryPolicy::new`](crate::RetryPolicy::new).
    /// Rules:
    /// - `max_attempts` raised to 1.
    /// - `base_delay` forced ≤ `max_delay`.
    pub fn validated(mut self) -> Self {
        if self.max_attempts == 0 {
            warn!("max_attempts is 0, using 1");
            self.max_attempts = 1;
        }
        if self.base_delay > self.max_delay {
            warn!(
                base_ms = self.base_delay.as_millis() as u64,
                max_ms = self.max_delay.as_millis() as u64,
                "base_delay exceeds max_delay, clamping"
            );
            self.base_delay = self.max_delay;
        }
        self
    }
}
