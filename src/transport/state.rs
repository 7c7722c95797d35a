//! Connection state machine and reconnect backoff — pure, synchronously
//! testable logic kept separate from the actual socket I/O in
//! [`super::client`].

use std::time::Duration;

use crate::config::TransportConfig;

/// The lifecycle of one [`super::client::TransportClient`] connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Tracks reconnect attempts against a configured delay sequence and ceiling.
#[derive(Debug, Clone)]
pub struct ReconnectCounter {
    attempt: u32,
    max_attempts: u32,
    delays: Vec<Duration>,
}

impl ReconnectCounter {
    #[must_use]
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            attempt: 0,
            max_attempts: config.max_reconnect_attempts,
            delays: config.reconnect_delays.clone(),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let index = (attempt.saturating_sub(1)) as usize;
        self.delays
            .get(index)
            .copied()
            .unwrap_or_else(|| *self.delays.last().expect("non-empty delay sequence"))
    }

    /// Record one more attempt and return its delay, or `None` if the
    /// configured maximum has been exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.delay_for(self.attempt))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_delays(delays: Vec<Duration>, max: u32) -> TransportConfig {
        let mut cfg = TransportConfig::default();
        cfg.reconnect_delays = delays;
        cfg.max_reconnect_attempts = max;
        cfg
    }

    #[test]
    fn backoff_follows_fixed_sequence_then_repeats() {
        let cfg = config_with_delays(
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1_000),
                Duration::from_millis(30_000),
            ],
            10,
        );
        let mut counter = ReconnectCounter::new(&cfg);
        assert_eq!(counter.next_delay(), Some(Duration::from_millis(500)));
        assert_eq!(counter.next_delay(), Some(Duration::from_millis(1_000)));
        assert_eq!(counter.next_delay(), Some(Duration::from_millis(30_000)));
        assert_eq!(counter.next_delay(), Some(Duration::from_millis(30_000)));
    }

    #[test]
    fn counter_exhausts_after_max_attempts() {
        let cfg = config_with_delays(vec![Duration::from_millis(1)], 3);
        let mut counter = ReconnectCounter::new(&cfg);
        assert!(counter.next_delay().is_some());
        assert!(counter.next_delay().is_some());
        assert!(counter.next_delay().is_some());
        assert!(counter.next_delay().is_none());
        assert_eq!(counter.attempt(), 3);
    }

    #[test]
    fn reset_restarts_sequence() {
        let cfg = config_with_delays(vec![Duration::from_millis(500)], 3);
        let mut counter = ReconnectCounter::new(&cfg);
        counter.next_delay();
        counter.next_delay();
        counter.reset();
        assert_eq!(counter.attempt(), 0);
        assert_eq!(counter.next_delay(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn is_connected_only_true_for_connected_variant() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Reconnecting.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(!ConnectionState::Error.is_connected());
    }
}
