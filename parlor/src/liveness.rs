//! Liveness tracking for the persistent connection.
//!
//! The session sends an application-level heartbeat on a fixed cadence and
//! separately checks how long it has been since *any* inbound traffic
//! arrived. Liveness is connection-level, not heartbeat-protocol-level:
//! a chat frame refreshes it just as well as a heartbeat ack, so active
//! conversations never trip a false positive. When the silence window is
//! exceeded the connection is presumed dead even if the transport never
//! reported a close — this is what catches silent/half-open failures.

use std::time::Duration;

use tokio::time::Instant;

/// Timing parameters for heartbeat emission and staleness detection.
#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    /// Interval between outbound heartbeat frames.
    pub emit_interval: Duration,
    /// Silence window after which the connection is presumed dead.
    pub max_silence: Duration,
}

impl LivenessConfig {
    /// Build a config from the emit interval with the default silence
    /// window of three missed heartbeats.
    #[must_use]
    pub fn from_emit_interval(emit_interval: Duration) -> Self {
        Self {
            emit_interval,
            max_silence: emit_interval * 3,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self::from_emit_interval(Duration::from_secs(10))
    }
}

/// Tracks when the connection last produced any inbound event.
///
/// Reset at connect time; the session calls [`record_frame`] for every
/// inbound socket event and [`is_stale`] on each check tick.
///
/// [`record_frame`]: LivenessMonitor::record_frame
/// [`is_stale`]: LivenessMonitor::is_stale
#[derive(Debug)]
pub struct LivenessMonitor {
    max_silence: Duration,
    last_received: Instant,
}

impl LivenessMonitor {
    /// Create a monitor that considers the connection fresh as of now.
    #[must_use]
    pub fn new(config: &LivenessConfig) -> Self {
        Self {
            max_silence: config.max_silence,
            last_received: Instant::now(),
        }
    }

    /// Note that an inbound event arrived. Any frame counts, not only
    /// heartbeat acks.
    pub fn record_frame(&mut self) {
        self.last_received = Instant::now();
    }

    /// Restart the silence window, as done when a connection is (re)opened.
    pub fn reset(&mut self) {
        self.last_received = Instant::now();
    }

    /// How long the connection has been silent.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_received.elapsed()
    }

    /// Whether the silence window has been exceeded.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.silence() > self.max_silence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_silence_is_three_emit_intervals() {
        let config = LivenessConfig::default();
        assert_eq!(config.emit_interval, Duration::from_secs(10));
        assert_eq!(config.max_silence, Duration::from_secs(30));
    }

    #[test]
    fn fresh_monitor_is_not_stale() {
        let monitor = LivenessMonitor::new(&LivenessConfig::default());
        assert!(!monitor.is_stale());
    }

    #[tokio::test]
    async fn silence_beyond_window_is_stale() {
        let config = LivenessConfig {
            emit_interval: Duration::from_millis(10),
            max_silence: Duration::from_millis(30),
        };
        let monitor = LivenessMonitor::new(&config);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(monitor.is_stale());
    }

    #[tokio::test]
    async fn any_frame_refreshes_liveness() {
        let config = LivenessConfig {
            emit_interval: Duration::from_millis(10),
            max_silence: Duration::from_millis(50),
        };
        let mut monitor = LivenessMonitor::new(&config);
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.record_frame();
        tokio::time::sleep(Duration::from_millis(30)).await;
        // 60ms since construction but only 30ms since the last frame.
        assert!(!monitor.is_stale());
    }
}
