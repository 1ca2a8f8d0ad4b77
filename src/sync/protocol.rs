//! JSON relay wire format.
//!
//! Both event kinds share one frame shape, `{"event": <kind>, "payload": {"update": <base64>}}`.
//! For `delta` frames the update is an encoded Automerge change chunk; for `presence`
//! frames it is the JSON-encoded [`PresenceRecord`](super::presence::PresenceRecord).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::relay::{RelayKind, RelayMessage};

/// Maximum accepted frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid base64 payload: {0}")]
    InvalidPayload(String),

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),
}

/// Body shared by both event kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub update: String,
}

/// One relay frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "lowercase")]
pub enum WireMessage {
    Delta(UpdatePayload),
    Presence(UpdatePayload),
}

impl WireMessage {
    pub fn kind(&self) -> RelayKind {
        match self {
            WireMessage::Delta(_) => RelayKind::Delta,
            WireMessage::Presence(_) => RelayKind::Presence,
        }
    }

    /// Encode to a JSON text frame
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::InvalidFrame(e.to_string()))
    }

    /// Decode a JSON text frame
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(frame.len(), MAX_FRAME_SIZE));
        }
        serde_json::from_str(frame).map_err(|e| ProtocolError::InvalidFrame(e.to_string()))
    }

    /// Decode the base64 update into a relay message
    pub fn into_relay(self) -> Result<RelayMessage, ProtocolError> {
        let kind = self.kind();
        let (WireMessage::Delta(body) | WireMessage::Presence(body)) = self;
        let payload = STANDARD
            .decode(body.update.as_bytes())
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;

        Ok(RelayMessage {
            kind,
            payload: Bytes::from(payload),
        })
    }
}

impl From<&RelayMessage> for WireMessage {
    fn from(message: &RelayMessage) -> Self {
        let body = UpdatePayload {
            update: STANDARD.encode(&message.payload),
        };
        match message.kind {
            RelayKind::Delta => WireMessage::Delta(body),
            RelayKind::Presence => WireMessage::Presence(body),
        }
    }
}
