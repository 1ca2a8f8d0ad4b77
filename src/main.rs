//! Board Sync Relay - fan-out and snapshot server for shared boards
//!
//! Serves `/relay/:document_id` WebSockets and `GET/PUT /api/snapshots/:document_id`
//! over a sled store. See [`board_sync::server`] for the routes.

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use board_sync::server::{router, AppState};
use board_sync::storage::{SledStore, StorageConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "board_sync=info,board_sync_relay=info,tower_http=info".into()),
        )
        .init();

    dotenvy::dotenv().ok();

    let storage_path =
        std::env::var("STORAGE_PATH").unwrap_or_else(|_| "./data/boards.sled".to_string());
    info!("Initializing storage at: {}", storage_path);
    let store = SledStore::open(StorageConfig::new(&storage_path))?;

    let state = Arc::new(AppState::new(store));
    let app = router(state.clone());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("Board sync relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   Relay: ws://{}/relay/:document_id", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    state.store().flush()?;
    Ok(())
}
