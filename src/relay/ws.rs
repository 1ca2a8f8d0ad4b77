//! WebSocket relay client.
//!
//! Connects to `<endpoint>/relay/<document_id>` on a `board-sync-relay` server and
//! exchanges JSON [`WireMessage`] text frames. The subscription is confirmed once the
//! WebSocket handshake completes. Any socket error kills the channel; reconnecting is
//! the session's decision. A handshake that does not finish within the connect
//! timeout fails the subscribe.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{RelayChannel, RelayEndpoint, RelayError, RelayEvent, RelayTransport};
use crate::sync::protocol::WireMessage;

/// Relay transport over WebSocket
#[derive(Debug, Clone)]
pub struct WsRelay {
    /// Base URL, e.g. `ws://localhost:5000`
    endpoint: String,
    connect_timeout: Duration,
}

impl WsRelay {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Bound on TCP connect plus WebSocket handshake
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Read the endpoint from `BOARD_SYNC_RELAY_URL`
    pub fn from_env() -> Option<Self> {
        std::env::var("BOARD_SYNC_RELAY_URL").ok().map(Self::new)
    }

    pub fn url_for(&self, document_id: &str) -> String {
        format!("{}/relay/{}", self.endpoint.trim_end_matches('/'), document_id)
    }
}

#[async_trait]
impl RelayTransport for WsRelay {
    async fn subscribe(&self, document_id: &str) -> Result<RelayChannel, RelayError> {
        let url = self.url_for(document_id);
        let (socket, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                RelayError::Subscribe(
                    document_id.to_string(),
                    format!("handshake timed out after {:?}", self.connect_timeout),
                )
            })?
            .map_err(|e| RelayError::Subscribe(document_id.to_string(), e.to_string()))?;

        info!("Relay connected: {}", url);

        let (channel, endpoint) = RelayChannel::pair();
        tokio::spawn(pump(socket, endpoint));
        Ok(channel)
    }
}

async fn pump(socket: WebSocketStream<MaybeTlsStream<TcpStream>>, mut endpoint: RelayEndpoint) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    if !endpoint.report(RelayEvent::Subscribed) {
        return;
    }

    loop {
        tokio::select! {
            outbound = endpoint.outbound.recv() => {
                let Some(message) = outbound else {
                    // Session released the channel
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                };

                let frame = match WireMessage::from(&message).encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Dropping unencodable relay message: {}", e);
                        continue;
                    }
                };

                if let Err(e) = ws_sender.send(Message::Text(frame)).await {
                    endpoint.report(RelayEvent::Error(e.to_string()));
                    break;
                }
            }
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match WireMessage::decode(&text).and_then(WireMessage::into_relay) {
                            Ok(message) => {
                                if !endpoint.report(RelayEvent::Message(message)) {
                                    break;
                                }
                            }
                            Err(e) => warn!("Dropping malformed relay frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        endpoint.report(RelayEvent::Closed);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        endpoint.report(RelayEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
        }
    }

    debug!("Relay pump finished");
}
