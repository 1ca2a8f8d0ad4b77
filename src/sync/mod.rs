//! Synchronization module for CRDT-based real-time board replication.
//!
//! This module implements the per-document engine using Automerge CRDTs.
//! It provides:
//! - The board document wrapper (opaque keyed map, origin-tagged deltas)
//! - JSON relay wire format
//! - Per-document synchronization sessions (save policy, reconnect state machine)
//! - The board registry that owns every live session
//! - Presence records carried beside the document

pub mod document;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod status;

pub use document::{BoardDocument, DocumentHandle, DocumentUpdate};
pub use registry::{BoardRegistry, Teardown};
pub use session::{SessionPhase, SyncSession};
pub use status::{StatusCallback, StatusSink};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::relay::RelayError;
use crate::storage::StorageError;
use document::DocumentError;
use presence::PresenceError;
use protocol::ProtocolError;

/// Unique identifier for a shared board document
pub type DocumentId = String;

/// Unique identifier for a presence participant
pub type ParticipantId = String;

/// Full encoded CRDT state
pub type Snapshot = Vec<u8>;

/// Where a document mutation came from.
///
/// Only used to decide whether a delta is re-broadcast; it never affects the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
}

/// Relay connectivity as seen by one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur inside a synchronization session
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Presence error: {0}")]
    Presence(#[from] PresenceError),
}

/// Shortest timer the session will arm; zero periods are raised to this
pub const MIN_TIMER: Duration = Duration::from_millis(1);

/// Configuration for session save and subscribe behavior
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet window after the last local edit before a debounced save fires
    pub debounce: Duration,
    /// Unconditional backstop save interval
    pub save_interval: Duration,
    /// How long one relay subscribe attempt may take before the session degrades
    pub subscribe_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            save_interval: Duration::from_secs(5),
            subscribe_timeout: Duration::from_secs(10),
        }
    }
}

impl SyncConfig {
    /// Read overrides from `BOARD_SYNC_DEBOUNCE_MS`, `BOARD_SYNC_SAVE_INTERVAL_MS`
    /// and `BOARD_SYNC_SUBSCRIBE_TIMEOUT_MS`.
    ///
    /// Missing, unparsable or zero values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = |key: &str| parse_millis(std::env::var(key).ok().as_deref());

        Self {
            debounce: millis("BOARD_SYNC_DEBOUNCE_MS").unwrap_or(defaults.debounce),
            save_interval: millis("BOARD_SYNC_SAVE_INTERVAL_MS").unwrap_or(defaults.save_interval),
            subscribe_timeout: millis("BOARD_SYNC_SUBSCRIBE_TIMEOUT_MS")
                .unwrap_or(defaults.subscribe_timeout),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce.max(MIN_TIMER);
        self
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval.max(MIN_TIMER);
        self
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout.max(MIN_TIMER);
        self
    }
}

/// A positive millisecond count
fn parse_millis(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::from(RelayError::Closed);
        assert_eq!(err.to_string(), "Relay error: Channel closed");

        let err = SyncError::from(DocumentError::EmptyKey);
        assert!(matches!(err, SyncError::Document(_)));
    }

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.debounce, Duration::from_secs(1));
        assert_eq!(config.save_interval, Duration::from_secs(5));
        assert_eq!(config.subscribe_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_sync_config_builder() {
        let config = SyncConfig::default()
            .with_debounce(Duration::from_millis(250))
            .with_save_interval(Duration::from_secs(30));

        assert_eq!(config.debounce, Duration::from_millis(250));
        assert_eq!(config.save_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_sync_config_zero_durations_clamped() {
        let config = SyncConfig::default()
            .with_debounce(Duration::ZERO)
            .with_save_interval(Duration::ZERO)
            .with_subscribe_timeout(Duration::ZERO);

        assert_eq!(config.debounce, MIN_TIMER);
        assert_eq!(config.save_interval, MIN_TIMER);
        assert_eq!(config.subscribe_timeout, MIN_TIMER);
    }

    #[test]
    fn test_parse_millis() {
        assert_eq!(parse_millis(Some("250")), Some(Duration::from_millis(250)));
        assert_eq!(parse_millis(Some(" 40 ")), Some(Duration::from_millis(40)));
        assert_eq!(parse_millis(Some("0")), None);
        assert_eq!(parse_millis(Some("-5")), None);
        assert_eq!(parse_millis(Some("soon")), None);
        assert_eq!(parse_millis(None), None);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ConnectionStatus::Disconnected).unwrap();
        assert_eq!(json, "\"disconnected\"");
    }
}
