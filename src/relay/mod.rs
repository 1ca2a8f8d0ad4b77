//! Relay channels: per-board publish/subscribe transports.
//!
//! A [`RelayTransport`] opens subscriptions; each subscription is a [`RelayChannel`]
//! owned by exactly one session. The channel is a pair of unbounded queues: outbound
//! messages the session publishes, and inbound [`RelayEvent`]s the transport reports.
//! Transports never retry on their own. A dead channel is replaced by asking the
//! transport for a brand-new one.
//!
//! Implementations:
//! - [`LocalRelay`]: in-process hub over `tokio::sync::broadcast`
//! - [`WsRelay`]: WebSocket client for the `board-sync-relay` server

mod local;
mod ws;

pub use local::LocalRelay;
pub use ws::WsRelay;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::sync::{ConnectionStatus, DocumentId};

/// Errors surfaced by relay transports
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("Failed to subscribe to {0}: {1}")]
    Subscribe(DocumentId, String),

    #[error("Channel closed")]
    Closed,
}

/// The two kinds of traffic a board channel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayKind {
    Delta,
    Presence,
}

/// One relayed payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub kind: RelayKind,
    pub payload: Bytes,
}

impl RelayMessage {
    pub fn delta(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: RelayKind::Delta,
            payload: payload.into(),
        }
    }

    pub fn presence(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: RelayKind::Presence,
            payload: payload.into(),
        }
    }
}

/// What a transport reports to the owning session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// The subscription is confirmed and live
    Subscribed,
    /// A message from another subscriber of the same board
    Message(RelayMessage),
    /// Transport failure; the channel is dead
    Error(String),
    /// The transport closed the channel
    Closed,
}

/// Opens subscriptions for a board
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open a fresh subscription. Never reuses a previous one.
    async fn subscribe(&self, document_id: &str) -> Result<RelayChannel, RelayError>;
}

/// Session-side half of a subscription
#[derive(Debug)]
pub struct RelayChannel {
    outbound: mpsc::UnboundedSender<RelayMessage>,
    inbound: mpsc::UnboundedReceiver<RelayEvent>,
    status: ConnectionStatus,
}

/// Transport-side half of a subscription
#[derive(Debug)]
pub struct RelayEndpoint {
    /// Messages the session wants published
    pub outbound: mpsc::UnboundedReceiver<RelayMessage>,
    /// Events to report back to the session
    pub events: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayEndpoint {
    /// Report an event; returns false once the session has dropped the channel
    pub fn report(&self, event: RelayEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

impl RelayChannel {
    /// Create a connected pair. The channel starts `Disconnected` until the
    /// transport reports [`RelayEvent::Subscribed`].
    pub fn pair() -> (RelayChannel, RelayEndpoint) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            RelayChannel {
                outbound: outbound_tx,
                inbound: events_rx,
                status: ConnectionStatus::Disconnected,
            },
            RelayEndpoint {
                outbound: outbound_rx,
                events: events_tx,
            },
        )
    }

    /// Queue a message for every other subscriber
    pub fn publish(&self, kind: RelayKind, payload: impl Into<Bytes>) -> Result<(), RelayError> {
        self.outbound
            .send(RelayMessage {
                kind,
                payload: payload.into(),
            })
            .map_err(|_| RelayError::Closed)
    }

    /// Wait for the next transport event. A vanished transport reads as `Closed`.
    pub async fn next_event(&mut self) -> RelayEvent {
        let event = self.inbound.recv().await.unwrap_or(RelayEvent::Closed);
        match event {
            RelayEvent::Subscribed => self.status = ConnectionStatus::Connected,
            RelayEvent::Error(_) | RelayEvent::Closed => self.status = ConnectionStatus::Disconnected,
            RelayEvent::Message(_) => {}
        }
        event
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_status_follows_events() {
        let (mut channel, endpoint) = RelayChannel::pair();
        assert_eq!(channel.status(), ConnectionStatus::Disconnected);

        endpoint.report(RelayEvent::Subscribed);
        assert_eq!(channel.next_event().await, RelayEvent::Subscribed);
        assert_eq!(channel.status(), ConnectionStatus::Connected);

        endpoint.report(RelayEvent::Error("boom".into()));
        assert!(matches!(channel.next_event().await, RelayEvent::Error(_)));
        assert_eq!(channel.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_dropped_endpoint_reads_closed() {
        let (mut channel, endpoint) = RelayChannel::pair();
        drop(endpoint);

        assert_eq!(channel.next_event().await, RelayEvent::Closed);
        assert!(matches!(
            channel.publish(RelayKind::Delta, vec![1u8]),
            Err(RelayError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_publish_reaches_endpoint() {
        let (channel, mut endpoint) = RelayChannel::pair();
        channel.publish(RelayKind::Presence, vec![7u8]).unwrap();

        let message = endpoint.outbound.recv().await.unwrap();
        assert_eq!(message, RelayMessage::presence(vec![7u8]));
    }
}
