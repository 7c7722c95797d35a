//! Configuration knobs, read once at construction.
//!
//! Every field has the default named in the protocol design. Each can be
//! overridden by an environment variable of the same name (upper-cased,
//! `VOICECHAT_` prefixed) so a deployment can tune timing without a rebuild.

use std::time::Duration;

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Transport-level configuration (C1).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long a latent `send` waits for `connected` before failing.
    pub connection_timeout: Duration,
    /// Maximum automatic reconnect attempts before moving to `error`.
    pub max_reconnect_attempts: u32,
    /// Interval of the liveness health-check timer.
    pub liveness_interval: Duration,
    /// Reconnect backoff delays, applied in order; the last entry repeats.
    pub reconnect_delays: Vec<Duration>,
    /// Debounce window for the network-status monitor.
    pub network_debounce: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connection_timeout: env_duration_secs(
                "VOICECHAT_CONNECTION_TIMEOUT",
                Duration::from_secs(30),
            ),
            max_reconnect_attempts: env_u32("VOICECHAT_MAX_RECONNECT_ATTEMPTS", 6),
            liveness_interval: env_duration_secs(
                "VOICECHAT_LIVENESS_INTERVAL",
                Duration::from_secs(30),
            ),
            reconnect_delays: vec![
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
            network_debounce: Duration::from_millis(500),
        }
    }
}

impl TransportConfig {
    /// The backoff delay for the given 1-indexed attempt number. Attempts
    /// beyond the configured sequence repeat the final delay.
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1)) as usize;
        self.reconnect_delays
            .get(idx)
            .copied()
            .unwrap_or_else(|| *self.reconnect_delays.last().expect("non-empty"))
    }
}

/// Request-tracker configuration (C5).
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Default per-request timeout when the caller does not specify one.
    pub default_timeout: Duration,
    /// Maximum number of outstanding requests before the oldest is evicted.
    pub max_pending: usize,
    /// Interval of the background sweep that catches lost timer firings.
    pub sweep_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            default_timeout: env_duration_secs(
                "VOICECHAT_REQUEST_DEFAULT_TIMEOUT",
                Duration::from_secs(30),
            ),
            max_pending: env_usize("VOICECHAT_REQUEST_MAX_PENDING", 100),
            sweep_interval: env_duration_secs(
                "VOICECHAT_TRACKER_SWEEP_INTERVAL",
                Duration::from_secs(60),
            ),
        }
    }
}

/// Capture-pipeline configuration (C7).
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Fixed frame size, in samples, delivered to the frame callback.
    pub buffer_samples: usize,
    /// Sample rate requested of the device; the device may return a
    /// different *actual* rate.
    pub requested_sample_rate: u32,
    /// Default spoken-language tag sent with `audio.start`.
    pub default_language: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_samples: env_usize("VOICECHAT_CAPTURE_BUFFER_SAMPLES", 4096),
            requested_sample_rate: env_u32("VOICECHAT_DEFAULT_SAMPLE_RATE", 16_000),
            default_language: env_string("VOICECHAT_DEFAULT_LANGUAGE", "en-US"),
        }
    }
}

/// Top-level configuration composed of every subsystem's knobs.
#[derive(Debug, Clone, Default)]
pub struct VoiceChatConfig {
    pub transport: TransportConfig,
    pub tracker: TrackerConfig,
    pub capture: CaptureConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_sequence_then_repeats() {
        let cfg = TransportConfig::default();
        assert_eq!(cfg.reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(cfg.reconnect_delay(2), Duration::from_secs(5));
        assert_eq!(cfg.reconnect_delay(3), Duration::from_secs(10));
        assert_eq!(cfg.reconnect_delay(4), Duration::from_secs(10));
        assert_eq!(cfg.reconnect_delay(50), Duration::from_secs(10));
    }

    #[test]
    fn defaults_match_design_values() {
        let cfg = VoiceChatConfig::default();
        assert_eq!(cfg.transport.max_reconnect_attempts, 6);
        assert_eq!(cfg.tracker.max_pending, 100);
        assert_eq!(cfg.capture.buffer_samples, 4096);
        assert_eq!(cfg.capture.requested_sample_rate, 16_000);
    }
}
