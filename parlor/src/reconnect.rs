//! Reconnect backoff policy.
//!
//! A pure delay computation: `min(cap, base * growth^n)` for the n-th
//! consecutive failure. There is no maximum-attempts ceiling — transient
//! network loss is treated as recoverable indefinitely, matching a client
//! that stays open across sleep/wake and network-switch events. The session
//! interrupts a backoff wait early when the host signals that connectivity
//! or foreground visibility returned (`ChatSession::retry_now`).

use std::time::Duration;

/// Exponential backoff parameters for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Multiplier applied per consecutive failure.
    pub growth: f64,
    /// Upper bound on the computed delay.
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5000),
            growth: 1.5,
            cap: Duration::from_millis(30000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before the attempt following `prior_failures`
    /// consecutive failures. Monotonically non-decreasing in
    /// `prior_failures` and never above the cap.
    #[must_use]
    pub fn next_delay(&self, prior_failures: u32) -> Duration {
        let exponent = i32::try_from(prior_failures).unwrap_or(i32::MAX);
        let factor = self.growth.powi(exponent);
        let scaled = self.base.as_millis() as f64 * factor;
        if !scaled.is_finite() || scaled >= self.cap.as_millis() as f64 {
            return self.cap;
        }
        Duration::from_millis(scaled as u64)
    }
}
