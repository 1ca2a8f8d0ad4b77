//! Presence and cursor records for real-time collaboration.
//!
//! Presence is ephemeral state that never enters the CRDT:
//! - Participant identity (display name, avatar)
//! - Canvas cursor position, or `None` once the cursor leaves the board
//!
//! The latest record from a participant replaces every earlier one. There is no
//! expiry: a participant whose process dies without publishing a final record stays
//! in the map until the session is torn down.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{DocumentId, ParticipantId};

fn default_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Cursor position in board coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// Complete presence information for a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// Participant identifier
    pub participant_id: ParticipantId,
    /// Display name
    pub display_name: String,
    /// Avatar URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Current cursor, `None` when outside the board
    pub cursor: Option<CursorPosition>,
    /// Sender's wall clock when the record was produced (milliseconds since epoch).
    /// Informational only; replacement is by arrival, not by timestamp.
    #[serde(default = "default_timestamp")]
    pub updated_at_ms: i64,
}

impl PresenceRecord {
    pub fn new(participant_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            display_name: display_name.into(),
            avatar: None,
            cursor: None,
            updated_at_ms: default_timestamp(),
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    /// Same participant, cursor moved to `(x, y)`
    pub fn moved_to(mut self, x: f64, y: f64) -> Self {
        self.cursor = Some(CursorPosition { x, y });
        self.updated_at_ms = default_timestamp();
        self
    }

    /// Same participant, cursor left the board
    pub fn left(mut self) -> Self {
        self.cursor = None;
        self.updated_at_ms = default_timestamp();
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, PresenceError> {
        serde_json::to_vec(self).map_err(|e| PresenceError::Malformed(e.to_string()))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PresenceError> {
        let record: PresenceRecord =
            serde_json::from_slice(payload).map_err(|e| PresenceError::Malformed(e.to_string()))?;
        if record.participant_id.is_empty() {
            return Err(PresenceError::MissingParticipant);
        }
        Ok(record)
    }
}

/// Event types for presence changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceEvent {
    /// A participant's record was replaced
    Updated {
        document_id: DocumentId,
        record: PresenceRecord,
    },
    /// A participant's record was dropped
    Removed {
        document_id: DocumentId,
        participant_id: ParticipantId,
    },
}

/// Presence errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PresenceError {
    #[error("Malformed presence record: {0}")]
    Malformed(String),

    #[error("Presence record has no participant id")]
    MissingParticipant,
}

/// Remote participants' latest records for one board
#[derive(Debug)]
pub struct PresenceMap {
    /// Board identifier
    document_id: DocumentId,
    /// Map of participant_id -> latest record
    participants: DashMap<ParticipantId, PresenceRecord>,
    /// Broadcast channel for presence events
    event_tx: broadcast::Sender<PresenceEvent>,
}

impl PresenceMap {
    pub fn new(document_id: impl Into<String>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            document_id: document_id.into(),
            participants: DashMap::new(),
            event_tx,
        }
    }

    /// Subscribe to presence events
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.event_tx.subscribe()
    }

    /// Replace a participant's record wholesale
    pub fn apply(&self, record: PresenceRecord) {
        self.participants
            .insert(record.participant_id.clone(), record.clone());

        let _ = self.event_tx.send(PresenceEvent::Updated {
            document_id: self.document_id.clone(),
            record,
        });
    }

    /// Decode and apply a relayed presence payload
    pub fn apply_encoded(&self, payload: &[u8]) -> Result<(), PresenceError> {
        let record = PresenceRecord::decode(payload)?;
        self.apply(record);
        Ok(())
    }

    /// Drop a participant
    pub fn remove(&self, participant_id: &str) -> Option<PresenceRecord> {
        let removed = self.participants.remove(participant_id).map(|(_, r)| r);

        if removed.is_some() {
            let _ = self.event_tx.send(PresenceEvent::Removed {
                document_id: self.document_id.clone(),
                participant_id: participant_id.to_string(),
            });
        }

        removed
    }

    /// Drop every participant
    pub fn clear(&self) {
        let ids: Vec<ParticipantId> = self.participants.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            self.remove(&id);
        }
    }

    pub fn get(&self, participant_id: &str) -> Option<PresenceRecord> {
        self.participants.get(participant_id).map(|r| r.clone())
    }

    pub fn all(&self) -> Vec<PresenceRecord> {
        self.participants.iter().map(|r| r.value().clone()).collect()
    }

    /// Participants whose cursor is currently on the board
    pub fn cursors(&self) -> Vec<(ParticipantId, CursorPosition)> {
        self.participants
            .iter()
            .filter_map(|r| r.cursor.map(|c| (r.key().clone(), c)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_creation() {
        let record = PresenceRecord::new("user-1", "Alice")
            .with_avatar("https://example.com/a.png")
            .moved_to(10.0, 20.5);

        assert_eq!(record.participant_id, "user-1");
        assert_eq!(record.avatar.as_deref(), Some("https://example.com/a.png"));
        assert_eq!(record.cursor, Some(CursorPosition { x: 10.0, y: 20.5 }));
        assert!(record.left().cursor.is_none());
    }

    #[test]
    fn test_latest_record_replaces() {
        let map = PresenceMap::new("board-1");
        map.apply(PresenceRecord::new("user-1", "Alice").moved_to(1.0, 1.0));
        map.apply(PresenceRecord::new("user-1", "Alice B.").left());

        assert_eq!(map.len(), 1);
        let record = map.get("user-1").unwrap();
        assert_eq!(record.display_name, "Alice B.");
        assert!(record.cursor.is_none());
        assert!(map.cursors().is_empty());
    }

    #[test]
    fn test_apply_encoded() {
        let map = PresenceMap::new("board-1");
        let payload = PresenceRecord::new("user-2", "Bob").moved_to(3.0, 4.0).encode().unwrap();

        map.apply_encoded(&payload).unwrap();
        assert_eq!(map.cursors(), vec![("user-2".to_string(), CursorPosition { x: 3.0, y: 4.0 })]);
    }

    #[test]
    fn test_malformed_payload() {
        let map = PresenceMap::new("board-1");
        assert!(matches!(map.apply_encoded(b"{oops"), Err(PresenceError::Malformed(_))));

        let nameless = br#"{"participant_id":"","display_name":"x","cursor":null}"#;
        assert!(matches!(map.apply_encoded(nameless), Err(PresenceError::MissingParticipant)));
        assert!(map.is_empty());
    }

    #[test]
    fn test_missing_timestamp_defaults() {
        let payload = br#"{"participant_id":"u","display_name":"x","cursor":{"x":1.0,"y":2.0}}"#;
        let record = PresenceRecord::decode(payload).unwrap();
        assert!(record.updated_at_ms > 0);
        assert!(record.avatar.is_none());
    }

    #[test]
    fn test_events() {
        let map = PresenceMap::new("board-1");
        let mut rx = map.subscribe();

        map.apply(PresenceRecord::new("user-1", "Alice"));
        map.clear();

        assert!(matches!(rx.try_recv().unwrap(), PresenceEvent::Updated { .. }));
        match rx.try_recv().unwrap() {
            PresenceEvent::Removed { participant_id, document_id } => {
                assert_eq!(participant_id, "user-1");
                assert_eq!(document_id, "board-1");
            }
            other => panic!("Expected Removed, got {:?}", other),
        }
        assert!(map.is_empty());
    }
}
