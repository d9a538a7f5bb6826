//! Sync engine configuration.

use crate::error::SyncError;
use huddle_protocol::MemberRole;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for [`SyncController`](crate::SyncController).
///
/// ```toml
/// subscribe_timeout_ms = 5000
/// event_queue_capacity = 512
/// default_role = "member"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How long a subscribe may go unacknowledged before `TimedOut`.
    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout_ms: u64,

    /// Capacity of the controller's event queue.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Capacity of the buffer between the transport and the subscriber.
    #[serde(default = "default_feed_buffer")]
    pub feed_buffer: usize,

    /// Role given to a membership created on first join.
    #[serde(default)]
    pub default_role: MemberRole,
}

fn default_subscribe_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_event_queue_capacity() -> usize {
    256
}

fn default_feed_buffer() -> usize {
    64
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            subscribe_timeout_ms: default_subscribe_timeout(),
            event_queue_capacity: default_event_queue_capacity(),
            feed_buffer: default_feed_buffer(),
            default_role: MemberRole::default(),
        }
    }
}

impl SyncConfig {
    /// Parse from a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfig`] if the document does not parse.
    pub fn from_toml_str(contents: &str) -> Result<Self, SyncError> {
        Ok(toml::from_str(contents)?)
    }

    #[must_use]
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.subscribe_timeout(), Duration::from_secs(10));
        assert_eq!(config.default_role, MemberRole::Member);
    }

    #[test]
    fn test_config_from_toml() {
        let config = SyncConfig::from_toml_str(
            r#"
            subscribe_timeout_ms = 2500
            default_role = "admin"
            "#,
        )
        .unwrap();
        assert_eq!(config.subscribe_timeout_ms, 2500);
        assert_eq!(config.default_role, MemberRole::Admin);
        assert_eq!(config.event_queue_capacity, 256);
    }

    #[test]
    fn test_config_rejects_bad_toml() {
        let err = SyncConfig::from_toml_str("subscribe_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
    }
}
