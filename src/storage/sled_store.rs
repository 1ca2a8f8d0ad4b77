//! Sled-based snapshot store.
//!
//! Keeps one tree of `document_id -> base64 snapshot` rows. Saves overwrite the
//! previous row; no history is kept. The async [`SnapshotStore`] impl runs sled
//! calls on the blocking pool, since a save may flush to disk.

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::{decode_row, encode_row, SnapshotStore, StorageConfig, StorageError, StorageResult};
use crate::sync::Snapshot;

const TREE_SNAPSHOTS: &str = "snapshots";

/// Sled-backed store for board snapshots
#[derive(Clone)]
pub struct SledStore {
    db: Arc<Db>,
    snapshots: Tree,
    config: StorageConfig,
}

impl SledStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let snapshots = db.open_tree(TREE_SNAPSHOTS)?;

        Ok(Self {
            db: Arc::new(db),
            snapshots,
            config,
        })
    }

    /// Open with default configuration
    pub fn open_default() -> StorageResult<Self> {
        Self::open(StorageConfig::default())
    }

    pub fn save_snapshot(&self, document_id: &str, snapshot: &[u8]) -> StorageResult<()> {
        write_row(&self.snapshots, self.flush_on_save(), document_id, snapshot)
    }

    pub fn load_snapshot(&self, document_id: &str) -> StorageResult<Option<Snapshot>> {
        read_row(&self.snapshots, document_id)
    }

    fn flush_on_save(&self) -> bool {
        self.config.flush_interval_ms == 0
    }

    /// Check if a board has a stored snapshot
    pub fn exists(&self, document_id: &str) -> StorageResult<bool> {
        Ok(self.snapshots.contains_key(document_id.as_bytes())?)
    }

    /// Delete a board's row. Called by whoever owns board deletion.
    pub fn delete(&self, document_id: &str) -> StorageResult<bool> {
        Ok(self.snapshots.remove(document_id.as_bytes())?.is_some())
    }

    /// List every stored board id
    pub fn document_ids(&self) -> StorageResult<Vec<String>> {
        let mut ids = Vec::new();
        for item in self.snapshots.iter() {
            let (key, _) = item?;
            ids.push(String::from_utf8_lossy(&key).to_string());
        }
        Ok(ids)
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            document_count: self.snapshots.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

fn write_row(tree: &Tree, flush: bool, document_id: &str, snapshot: &[u8]) -> StorageResult<()> {
    tree.insert(document_id.as_bytes(), encode_row(snapshot).into_bytes())?;

    if flush {
        tree.flush()?;
    }

    debug!("Stored snapshot for {} ({} bytes)", document_id, snapshot.len());
    Ok(())
}

fn read_row(tree: &Tree, document_id: &str) -> StorageResult<Option<Snapshot>> {
    match tree.get(document_id.as_bytes())? {
        Some(raw) => Ok(Some(decode_row(document_id, &raw)?)),
        None => Ok(None),
    }
}

// Only the tree handle crosses into the blocking pool; cloning the store itself
// would flush the whole db when the clone drops.
#[async_trait]
impl SnapshotStore for SledStore {
    async fn load(&self, document_id: &str) -> StorageResult<Option<Snapshot>> {
        let tree = self.snapshots.clone();
        let document_id = document_id.to_string();
        tokio::task::spawn_blocking(move || read_row(&tree, &document_id))
            .await
            .map_err(|e| StorageError::Blocking(e.to_string()))?
    }

    async fn save(&self, document_id: &str, snapshot: &[u8]) -> StorageResult<()> {
        let tree = self.snapshots.clone();
        let flush = self.flush_on_save();
        let document_id = document_id.to_string();
        let snapshot = snapshot.to_vec();
        tokio::task::spawn_blocking(move || write_row(&tree, flush, &document_id, &snapshot))
            .await
            .map_err(|e| StorageError::Blocking(e.to_string()))?
    }
}

/// Statistics about the storage
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub document_count: usize,
    pub total_size_bytes: u64,
}

impl Drop for SledStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.db.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, SledStore) {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string())
            .with_flush_interval(0);
        let store = SledStore::open(config).unwrap();
        (dir, store)
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = test_store();
        store.save_snapshot("board-1", b"snapshot bytes").unwrap();

        let loaded = store.load_snapshot("board-1").unwrap();
        assert_eq!(loaded, Some(b"snapshot bytes".to_vec()));
    }

    #[test]
    fn test_snapshot_not_found() {
        let (_dir, store) = test_store();
        assert!(store.load_snapshot("nonexistent").unwrap().is_none());
        assert!(!store.exists("nonexistent").unwrap());
    }

    #[test]
    fn test_save_supersedes() {
        let (_dir, store) = test_store();
        store.save_snapshot("board-1", b"first").unwrap();
        store.save_snapshot("board-1", b"second").unwrap();

        assert_eq!(store.load_snapshot("board-1").unwrap(), Some(b"second".to_vec()));
        assert_eq!(store.stats().document_count, 1);
    }

    #[test]
    fn test_rows_are_base64_text() {
        let (_dir, store) = test_store();
        store.save_snapshot("board-1", &[0xff, 0x00]).unwrap();

        let raw = store.snapshots.get("board-1").unwrap().unwrap();
        assert_eq!(&raw[..], b"/wA=");
    }

    #[test]
    fn test_hex_rows_load() {
        let (_dir, store) = test_store();
        store.snapshots.insert("board-1", &b"\\xff00"[..]).unwrap();

        assert_eq!(store.load_snapshot("board-1").unwrap(), Some(vec![0xff, 0x00]));
    }

    #[test]
    fn test_corrupt_row() {
        let (_dir, store) = test_store();
        store.snapshots.insert("board-1", &b"!!not a row!!"[..]).unwrap();

        assert!(matches!(
            store.load_snapshot("board-1"),
            Err(StorageError::Corruption(_, _))
        ));
    }

    #[test]
    fn test_delete_and_list() {
        let (_dir, store) = test_store();
        store.save_snapshot("board-a", b"a").unwrap();
        store.save_snapshot("board-b", b"b").unwrap();

        assert!(store.delete("board-a").unwrap());
        assert!(!store.delete("board-a").unwrap());
        assert_eq!(store.document_ids().unwrap(), vec!["board-b".to_string()]);
    }

    #[tokio::test]
    async fn test_snapshot_store_trait() {
        let (_dir, store) = test_store();
        let store: Arc<dyn SnapshotStore> = Arc::new(store);

        store.save("board-1", b"via trait").await.unwrap();
        assert_eq!(store.load("board-1").await.unwrap(), Some(b"via trait".to_vec()));
    }

    #[tokio::test]
    async fn test_trait_save_is_durable_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("durable.sled").to_string_lossy().to_string();

        {
            let store = SledStore::open(StorageConfig::new(&path).with_flush_interval(0)).unwrap();
            store.save("board-1", b"flushed").await.unwrap();
            assert!(store.exists("board-1").unwrap());
        }

        let reopened = SledStore::open(StorageConfig::new(&path)).unwrap();
        assert_eq!(reopened.load("board-1").await.unwrap(), Some(b"flushed".to_vec()));
    }
}
