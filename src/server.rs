//! Relay server: WebSocket fan-out and the snapshot API.
//!
//! - Axum WebSockets: every well-formed text frame on `/relay/:document_id` is
//!   forwarded to every other connection on the same board
//! - Sled snapshot rows behind `GET/PUT /api/snapshots/:document_id`
//!
//! The server never merges documents. Clients own the CRDT state.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::storage::{decode_row, encode_row, SledStore, SnapshotBody, SnapshotStore};
use crate::sync::protocol::{ProtocolError, WireMessage, MAX_FRAME_SIZE};

const BOARD_CHANNEL_CAPACITY: usize = 1024;

/// A frame tagged with the connection that sent it
type Frame = (Uuid, String);

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// One fan-out channel per board with at least one connection
    boards: DashMap<String, broadcast::Sender<Frame>>,
    /// Snapshot rows
    store: SledStore,
    connections: AtomicUsize,
    started_at: std::time::Instant,
}

impl AppState {
    pub fn new(store: SledStore) -> Self {
        Self {
            boards: DashMap::new(),
            store,
            connections: AtomicUsize::new(0),
            started_at: std::time::Instant::now(),
        }
    }

    pub fn store(&self) -> &SledStore {
        &self.store
    }

    /// Boards with at least one live connection
    pub fn active_boards(&self) -> usize {
        self.boards.len()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    fn board(&self, document_id: &str) -> broadcast::Sender<Frame> {
        self.boards
            .entry(document_id.to_string())
            .or_insert_with(|| broadcast::channel(BOARD_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Drop the board's channel once its last connection is gone
    fn release_board(&self, document_id: &str) {
        self.boards
            .remove_if(document_id, |_, sender| sender.receiver_count() == 0);
    }
}

/// Build the relay router with CORS and request tracing
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/snapshots/:document_id",
            get(get_snapshot).put(put_snapshot),
        )
        .route("/relay/:document_id", get(ws_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_boards: usize,
    pub connections: usize,
    pub stored_boards: usize,
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_boards: state.active_boards(),
        connections: state.connections(),
        stored_boards: state.store.stats().document_count,
    })
}

async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Result<Json<SnapshotBody>, StatusCode> {
    let snapshot = state
        .store
        .load(&document_id)
        .await
        .map_err(|e| {
            error!("Failed to load snapshot for {}: {}", document_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(SnapshotBody {
        snapshot: encode_row(&snapshot),
        document_id,
    }))
}

async fn put_snapshot(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
    Json(body): Json<SnapshotBody>,
) -> StatusCode {
    let snapshot = match decode_row(&document_id, body.snapshot.as_bytes()) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Rejected snapshot for {}: {}", document_id, e);
            return StatusCode::BAD_REQUEST;
        }
    };

    match state.store.save(&document_id, &snapshot).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            error!("Failed to save snapshot for {}: {}", document_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(document_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    debug!("WebSocket upgrade request for board: {}", document_id);
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_websocket(socket, document_id, state))
}

/// A frame is relayed only if it parses and its payload decodes
fn validate_frame(text: &str) -> Result<WireMessage, ProtocolError> {
    let message = WireMessage::decode(text)?;
    message.clone().into_relay()?;
    Ok(message)
}

/// Relay frames between one connection and the rest of its board
async fn handle_websocket(socket: WebSocket, document_id: String, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let connection_id = Uuid::new_v4();
    let board = state.board(&document_id);
    let mut frames = BroadcastStream::new(board.subscribe());

    state.connections.fetch_add(1, Ordering::Relaxed);
    info!("Connection {} joined board {}", connection_id, document_id);

    // Both halves run on this task so that leaving drops the board receiver at once
    let board_id = document_id.as_str();
    let forward = async move {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok((from, _)) if from == connection_id => {}
                Ok((_, text)) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(
                        "Connection {} on {} lagged, {} frames skipped",
                        connection_id, board_id, skipped
                    );
                }
            }
        }
        debug!("Forwarding ended for connection {}", connection_id);
    };

    let receive = async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => match validate_frame(&text) {
                    Ok(message) => {
                        debug!("Relaying {:?} on {}", message.kind(), board_id);
                        let _ = board.send((connection_id, text));
                    }
                    Err(e) => warn!("Dropping frame from {}: {}", connection_id, e),
                },
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", connection_id);
                    break;
                }
                _ => {}
            }
        }
        debug!("Receiving ended for connection {}", connection_id);
    };

    tokio::select! {
        _ = forward => {}
        _ = receive => {}
    }

    state.connections.fetch_sub(1, Ordering::Relaxed);
    state.release_board(&document_id);
    info!("Connection {} left board {}", connection_id, document_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayEvent, RelayKind, RelayMessage, RelayTransport, WsRelay};
    use crate::storage::{HttpStore, StorageConfig};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    async fn serve() -> (Arc<AppState>, SocketAddr, TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.sled").to_string_lossy().to_string();
        let store = SledStore::open(StorageConfig::new(path).with_flush_interval(0)).unwrap();
        let state = Arc::new(AppState::new(store));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        (state, addr, dir)
    }

    async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn delta_frame(payload: &[u8]) -> String {
        WireMessage::from(&RelayMessage::delta(payload.to_vec()))
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fan_out_skips_sender_and_other_boards() {
        let (state, addr, _dir) = serve().await;
        let relay = WsRelay::new(format!("ws://{}", addr));

        let mut alice = relay.subscribe("board-1").await.unwrap();
        let mut bob = relay.subscribe("board-1").await.unwrap();
        let mut carol = relay.subscribe("board-2").await.unwrap();
        for channel in [&mut alice, &mut bob, &mut carol] {
            assert_eq!(channel.next_event().await, RelayEvent::Subscribed);
        }
        wait_until("three connections", || state.connections() == 3).await;
        assert_eq!(state.active_boards(), 2);

        alice.publish(RelayKind::Delta, b"delta-1".to_vec()).unwrap();

        let event = timeout(Duration::from_secs(2), bob.next_event()).await.unwrap();
        assert_eq!(event, RelayEvent::Message(RelayMessage::delta(b"delta-1".to_vec())));
        assert!(timeout(Duration::from_millis(200), alice.next_event()).await.is_err());
        assert!(timeout(Duration::from_millis(200), carol.next_event()).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_frames_not_relayed() {
        let (state, addr, _dir) = serve().await;
        let url = format!("ws://{}/relay/board-1", addr);
        let (mut sender, _) = connect_async(url.as_str()).await.unwrap();
        let (mut receiver, _) = connect_async(url.as_str()).await.unwrap();
        wait_until("two connections", || state.connections() == 2).await;

        let valid = delta_frame(b"ok");
        for frame in [
            "not json".to_string(),
            r#"{"event":"bogus","payload":{"update":"AQID"}}"#.to_string(),
            r#"{"event":"delta","payload":{"update":"***"}}"#.to_string(),
            valid.clone(),
        ] {
            sender.send(WsMessage::Text(frame)).await.unwrap();
        }

        let received = timeout(Duration::from_secs(2), receiver.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received, WsMessage::Text(valid));
    }

    #[tokio::test]
    async fn test_board_released_after_last_connection() {
        let (state, addr, _dir) = serve().await;
        let url = format!("ws://{}/relay/board-1", addr);
        let (mut first, _) = connect_async(url.as_str()).await.unwrap();
        let (second, _) = connect_async(url.as_str()).await.unwrap();
        wait_until("two connections", || state.connections() == 2).await;
        assert_eq!(state.active_boards(), 1);

        first.close(None).await.unwrap();
        wait_until("one connection", || state.connections() == 1).await;
        assert_eq!(state.active_boards(), 1);

        drop(second);
        wait_until("board release", || state.active_boards() == 0).await;
        assert_eq!(state.connections(), 0);
    }

    #[tokio::test]
    async fn test_http_store_against_snapshot_api() {
        let (state, addr, _dir) = serve().await;
        let store = HttpStore::new(format!("http://{}", addr));

        assert_eq!(store.load("board-1").await.unwrap(), None);

        store.save("board-1", &[0x85, 0x6f, 0x4a, 0x83]).await.unwrap();
        assert_eq!(
            store.load("board-1").await.unwrap(),
            Some(vec![0x85, 0x6f, 0x4a, 0x83])
        );
        assert!(state.store().exists("board-1").unwrap());

        let health: HealthResponse = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.stored_boards, 1);
    }

    #[tokio::test]
    async fn test_put_rejects_undecodable_row() {
        let (_state, addr, _dir) = serve().await;
        let body = SnapshotBody {
            document_id: "board-1".to_string(),
            snapshot: "!!not a row!!".to_string(),
        };

        let response = reqwest::Client::new()
            .put(format!("http://{}/api/snapshots/board-1", addr))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
