//! Reconnect delay policy for the backend event stream.

use std::cmp;
use std::time::Duration;

const DEFAULT_MIN_DELAY_MS: u64 = 2_000;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_MULTIPLIER: f64 = 1.5;

/// Bounds and growth factor for reconnect delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(DEFAULT_MIN_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl BackoffPolicy {
    /// Delay that follows `current` after one more consecutive failure
    pub fn grow(&self, current: Duration) -> Duration {
        let scaled_ms = (current.as_millis() as f64 * self.multiplier).round();
        let next = Duration::from_millis(scaled_ms as u64);
        cmp::max(cmp::min(next, self.max_delay), self.min_delay)
    }
}

/// Current reconnect delay
#[derive(Debug, Clone)]
pub struct BackoffState {
    policy: BackoffPolicy,
    current: Duration,
}

impl BackoffState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.min_delay,
            policy,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delay to wait before the pending attempt; grows the stored delay for the next one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.policy.grow(delay);
        delay
    }

    /// Back to the floor after a successful connection or an explicit disconnect
    pub fn reset(&mut self) {
        self.current = self.policy.min_delay;
    }
}
