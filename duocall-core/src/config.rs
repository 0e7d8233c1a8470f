//! Core configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Call core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Directory recording files are written to.
    pub record_dir: PathBuf,
    /// Seconds an unanswered call may ring before it is marked missed.
    pub ring_timeout_secs: u64,
    /// Bitrate announced in congestion feedback when no cap is configured
    /// (effectively unlimited).
    pub default_feedback_bitrate: u32,
    /// Forward best-effort telemetry to the gateway's event collector.
    pub notify_events: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            record_dir: PathBuf::from("./recordings"),
            ring_timeout_secs: 60,
            default_feedback_bitrate: 10_000_000,
            notify_events: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.ring_timeout_secs, 60);
        assert_eq!(config.default_feedback_bitrate, 10_000_000);
        assert!(config.notify_events);
    }
}
