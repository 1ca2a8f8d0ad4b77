//! Storage module for durable board snapshots.
//!
//! One row per board: the key is the document id, the value is the latest full
//! Automerge snapshot. Rows are written as base64 text. Rows produced by other tooling
//! against a binary column come back as a hex-escaped literal (`\x0a1b...`), so the
//! loader accepts both encodings.

mod http;
mod memory;
mod sled_store;

pub use http::{HttpStore, SnapshotBody};
pub use memory::MemoryStore;
pub use sled_store::{SledStore, StorageStats};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use crate::sync::Snapshot;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Remote store error: {0}")]
    Remote(String),

    #[error("Corruption detected in snapshot for {0}: {1}")]
    Corruption(String, String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),

    #[error("Blocking storage task failed: {0}")]
    Blocking(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable snapshot store addressed by document id
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot, or `None` for a board that has never been saved
    async fn load(&self, document_id: &str) -> StorageResult<Option<Snapshot>>;

    /// Replace the stored snapshot
    async fn save(&self, document_id: &str, snapshot: &[u8]) -> StorageResult<()>;
}

/// Encode a snapshot as a row value
pub fn encode_row(snapshot: &[u8]) -> String {
    STANDARD.encode(snapshot)
}

/// Decode a row value written either as base64 text or as a `\x`-prefixed hex literal
pub fn decode_row(document_id: &str, raw: &[u8]) -> StorageResult<Snapshot> {
    let corrupt = |reason: String| StorageError::Corruption(document_id.to_string(), reason);
    let text = std::str::from_utf8(raw).map_err(|e| corrupt(e.to_string()))?.trim();

    if let Some(hex_digits) = text.strip_prefix("\\x") {
        return hex::decode(hex_digits).map_err(|e| corrupt(e.to_string()));
    }

    STANDARD.decode(text).map_err(|e| corrupt(e.to_string()))
}

/// Configuration for the sled-backed store
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = flush on every save)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/boards.sled".to_string(),
            cache_size: 256 * 1024 * 1024, // 256MB
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval(mut self, millis: u64) -> Self {
        self.flush_interval_ms = millis;
        self
    }
}
