//! Board Sync - per-document real-time replication and persistence
//!
//! Keeps every open copy of a shared board consistent using:
//! - Automerge CRDTs for order-independent merging of edits
//! - Relay channels (in-process or WebSocket) for low-latency delta fan-out
//! - Durable snapshot stores (sled, HTTP) with debounced and periodic saves
//! - A registry that owns one session per board and guards teardown
//! - The relay server those WebSocket clients connect to

pub mod relay;
pub mod server;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod testing;

pub use relay::{LocalRelay, RelayTransport, WsRelay};
pub use storage::{HttpStore, MemoryStore, SledStore, SnapshotStore, StorageConfig};
pub use sync::{
    presence::{PresenceMap, PresenceRecord},
    BoardDocument, BoardRegistry, ConnectionStatus, DocumentHandle, SyncConfig, SyncError,
    SyncSession,
};
