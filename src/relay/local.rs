//! In-process relay hub.
//!
//! Uses tokio broadcast channels for fan-out: every board gets one channel, each
//! subscription gets an independent receiver and a pump task that forwards in both
//! directions. Self-deliveries are filtered by subscriber id. A receiver that lags
//! past the channel capacity loses the overflowed messages, which the CRDT merge
//! tolerates.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{RelayChannel, RelayEndpoint, RelayError, RelayEvent, RelayMessage, RelayTransport};
use crate::sync::DocumentId;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Envelope {
    Message { from: u64, message: RelayMessage },
    /// Kill every current subscription of the board
    Sever,
}

#[derive(Debug)]
struct Hub {
    boards: DashMap<DocumentId, broadcast::Sender<Envelope>>,
    next_subscriber: AtomicU64,
    subscriptions: AtomicUsize,
    capacity: usize,
}

/// Relay transport for sessions living in the same process
#[derive(Debug, Clone)]
pub struct LocalRelay {
    hub: Arc<Hub>,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` is the number of messages buffered per subscriber before it lags
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            hub: Arc::new(Hub {
                boards: DashMap::new(),
                next_subscriber: AtomicU64::new(1),
                subscriptions: AtomicUsize::new(0),
                capacity,
            }),
        }
    }

    /// Fail every live subscription of `document_id` with a transport error
    pub fn sever(&self, document_id: &str) {
        if let Some(sender) = self.hub.boards.get(document_id) {
            let _ = sender.send(Envelope::Sever);
        }
    }

    /// Total subscriptions ever opened
    pub fn subscriptions_opened(&self) -> usize {
        self.hub.subscriptions.load(Ordering::SeqCst)
    }

    /// Subscribers currently attached to `document_id`
    pub fn subscriber_count(&self, document_id: &str) -> usize {
        self.hub
            .boards
            .get(document_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl RelayTransport for LocalRelay {
    async fn subscribe(&self, document_id: &str) -> Result<RelayChannel, RelayError> {
        let sender = self
            .hub
            .boards
            .entry(document_id.to_string())
            .or_insert_with(|| broadcast::channel(self.hub.capacity).0)
            .clone();
        let receiver = sender.subscribe();
        let subscriber = self.hub.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.hub.subscriptions.fetch_add(1, Ordering::SeqCst);

        let (channel, endpoint) = RelayChannel::pair();
        debug!("Local relay subscriber {} joined {}", subscriber, document_id);
        tokio::spawn(pump(subscriber, sender, receiver, endpoint));

        Ok(channel)
    }
}

async fn pump(
    subscriber: u64,
    sender: broadcast::Sender<Envelope>,
    mut receiver: broadcast::Receiver<Envelope>,
    mut endpoint: RelayEndpoint,
) {
    if !endpoint.report(RelayEvent::Subscribed) {
        return;
    }

    loop {
        tokio::select! {
            outbound = endpoint.outbound.recv() => {
                match outbound {
                    Some(message) => {
                        let _ = sender.send(Envelope::Message { from: subscriber, message });
                    }
                    // Session released the channel
                    None => break,
                }
            }
            inbound = receiver.recv() => {
                match inbound {
                    Ok(Envelope::Message { from, .. }) if from == subscriber => {}
                    Ok(Envelope::Message { message, .. }) => {
                        if !endpoint.report(RelayEvent::Message(message)) {
                            break;
                        }
                    }
                    Ok(Envelope::Sever) => {
                        endpoint.report(RelayEvent::Error("relay severed".to_string()));
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Local relay subscriber {} lagged, {} messages dropped", subscriber, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        endpoint.report(RelayEvent::Closed);
                        break;
                    }
                }
            }
        }
    }

    debug!("Local relay subscriber {} left", subscriber);
}
