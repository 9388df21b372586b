//! Reconnection backoff math.
//!
//! Free of any runtime dependencies so the manager and its tests share the
//! exact same delay computation.

use std::time::Duration;

// Reconnection defaults
pub const INITIAL_RETRY_DELAY_MS: u64 = 1_000;
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;
pub const MAX_RETRY_ATTEMPTS: u32 = 10;
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Exponential backoff policy for involuntary socket closes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt
    pub base_delay_ms: u64,
    /// Growth factor applied per consecutive failed attempt
    pub multiplier: f64,
    /// Ceiling for any single delay
    pub max_delay_ms: u64,
    /// Reconnects allowed before the channel gives up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: INITIAL_RETRY_DELAY_MS,
            multiplier: BACKOFF_MULTIPLIER,
            max_delay_ms: MAX_RETRY_DELAY_MS,
            max_attempts: MAX_RETRY_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay to wait before the reconnect that follows `attempts` consecutive
    /// failures, or `None` once the budget is spent.
    ///
    /// `min(base * multiplier^attempts, max)`
    pub fn delay_for(&self, attempts: u32) -> Option<Duration> {
        if self.is_exhausted(attempts) {
            return None;
        }

        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let raw = (self.base_delay_ms as f64) * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }
}
