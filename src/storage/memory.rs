//! In-process snapshot store.
//!
//! Rows go through the same base64 encoding as the durable stores.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use super::{decode_row, encode_row, SnapshotStore, StorageResult};
use crate::sync::Snapshot;

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    rows: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row value verbatim, bypassing encoding
    pub fn insert_raw(&self, document_id: impl Into<String>, raw: impl Into<String>) {
        self.rows.insert(document_id.into(), raw.into());
    }

    pub fn delete(&self, document_id: &str) -> bool {
        self.rows.remove(document_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self, document_id: &str) -> StorageResult<Option<Snapshot>> {
        match self.rows.get(document_id) {
            Some(raw) => Ok(Some(decode_row(document_id, raw.as_bytes())?)),
            None => Ok(None),
        }
    }

    async fn save(&self, document_id: &str, snapshot: &[u8]) -> StorageResult<()> {
        self.rows.insert(document_id.to_string(), encode_row(snapshot));
        Ok(())
    }
}
