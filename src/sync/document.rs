//! Automerge document wrapper for collaborative boards.
//!
//! A board is an opaque keyed map: every value is a byte blob whose meaning belongs
//! to the canvas layer. Each local mutation is committed as exactly one Automerge
//! change and announced to observers as an origin-tagged delta; remote deltas are
//! merged with `load_incremental`, which buffers changes whose dependencies have not
//! arrived yet, so delivery order and duplication do not affect the final state.

use automerge::{
    transaction::Transactable, AutoCommit, Automerge, AutomergeError, ChangeHash, LoadOptions,
    OnPartialLoad, ReadDoc, ScalarValue, Value, ROOT,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use super::{DocumentId, Origin, Snapshot};

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Keys must not be empty")]
    EmptyKey,
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// A change to the document, as seen by observers
#[derive(Debug, Clone)]
pub struct DocumentUpdate {
    /// Encoded change chunk(s), loadable by any replica of the same board
    pub delta: Bytes,
    /// Whether the change was made here or merged from a peer
    pub origin: Origin,
}

/// Collaborative board document backed by Automerge
pub struct BoardDocument {
    /// The underlying Automerge document
    doc: AutoCommit,
    /// Board identifier
    document_id: DocumentId,
    /// Update observers; closed receivers are pruned on the next emit
    observers: Vec<mpsc::UnboundedSender<DocumentUpdate>>,
}

impl BoardDocument {
    /// Create a new empty board
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            doc: AutoCommit::new(),
            document_id: document_id.into(),
            observers: Vec::new(),
        }
    }

    /// Load a board from a full snapshot
    pub fn load(document_id: impl Into<String>, snapshot: &[u8]) -> DocumentResult<Self> {
        let doc = AutoCommit::load(snapshot).map_err(|e| DocumentError::Malformed(e.to_string()))?;
        Ok(Self {
            doc,
            document_id: document_id.into(),
            observers: Vec::new(),
        })
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Receive every subsequent update, local or remote
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<DocumentUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    /// Store `value` under `key`, replacing any previous value
    pub fn set(&mut self, key: &str, value: impl Into<Vec<u8>>) -> DocumentResult<()> {
        if key.is_empty() {
            return Err(DocumentError::EmptyKey);
        }

        let heads = self.doc.get_heads();
        self.doc.put(ROOT, key, ScalarValue::Bytes(value.into()))?;
        self.commit_local(&heads);
        Ok(())
    }

    /// Remove `key`; returns whether anything was removed
    pub fn remove(&mut self, key: &str) -> DocumentResult<bool> {
        if !self.contains_key(key)? {
            return Ok(false);
        }

        let heads = self.doc.get_heads();
        self.doc.delete(ROOT, key)?;
        self.commit_local(&heads);
        Ok(true)
    }

    /// Read the blob stored under `key`
    pub fn get(&self, key: &str) -> DocumentResult<Option<Vec<u8>>> {
        if let Some((Value::Scalar(s), _)) = self.doc.get(ROOT, key)? {
            if let ScalarValue::Bytes(bytes) = s.as_ref() {
                return Ok(Some(bytes.clone()));
            }
        }
        Ok(None)
    }

    pub fn contains_key(&self, key: &str) -> DocumentResult<bool> {
        Ok(self.doc.get(ROOT, key)?.is_some())
    }

    pub fn keys(&self) -> Vec<String> {
        self.doc.keys(ROOT).collect()
    }

    pub fn len(&self) -> usize {
        self.doc.length(ROOT)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialize the whole map
    pub fn entries(&self) -> DocumentResult<BTreeMap<String, Vec<u8>>> {
        let mut entries = BTreeMap::new();
        for key in self.keys() {
            if let Some(value) = self.get(&key)? {
                entries.insert(key, value);
            }
        }
        Ok(entries)
    }

    /// Merge a delta (or a full snapshot) into this board.
    ///
    /// Returns the number of operations applied. Every chunk of the payload is
    /// checked first; if any chunk fails, the document is untouched and no update
    /// is emitted.
    pub fn apply(&mut self, delta: &[u8], origin: Origin) -> DocumentResult<usize> {
        validate_chunks(delta)?;

        let applied = self
            .doc
            .load_incremental(delta)
            .map_err(|e| DocumentError::Malformed(e.to_string()))?;

        self.emit(DocumentUpdate {
            delta: Bytes::copy_from_slice(delta),
            origin,
        });

        Ok(applied)
    }

    /// Encode the entire current state
    pub fn encode_full_state(&mut self) -> Snapshot {
        self.doc.save()
    }

    /// Current heads, sorted so two replicas can be compared directly
    pub fn heads(&mut self) -> Vec<ChangeHash> {
        let mut heads = self.doc.get_heads();
        heads.sort();
        heads
    }

    fn commit_local(&mut self, heads: &[ChangeHash]) {
        self.doc.commit();

        let mut delta = Vec::new();
        for change in self.doc.get_changes(heads) {
            delta.extend_from_slice(change.raw_bytes());
        }

        self.emit(DocumentUpdate {
            delta: Bytes::from(delta),
            origin: Origin::Local,
        });
    }

    fn emit(&mut self, update: DocumentUpdate) {
        self.observers.retain(|tx| tx.send(update.clone()).is_ok());
    }
}

/// Parse every chunk of `payload` without touching a live document.
///
/// `load_incremental` only logs a partial load on a non-empty document, so a
/// truncated or corrupt tail would otherwise be dropped silently. Changes whose
/// dependencies are missing are fine; they are buffered on merge.
fn validate_chunks(payload: &[u8]) -> DocumentResult<()> {
    if payload.is_empty() {
        return Err(DocumentError::Malformed("empty payload".into()));
    }

    let options = LoadOptions::new().on_partial_load(OnPartialLoad::Error);
    match Automerge::load_with_options(payload, options) {
        Ok(_) | Err(AutomergeError::MissingDeps) => Ok(()),
        Err(e) => Err(DocumentError::Malformed(e.to_string())),
    }
}

/// Shared handle to a live board, handed out by the registry
#[derive(Clone)]
pub struct DocumentHandle {
    inner: Arc<Mutex<BoardDocument>>,
}

impl DocumentHandle {
    pub fn new(document: BoardDocument) -> Self {
        Self {
            inner: Arc::new(Mutex::new(document)),
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.inner.lock().document_id().to_string()
    }

    /// Get document for reading or mutation
    pub fn with_document<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut BoardDocument) -> R,
    {
        let mut doc = self.inner.lock();
        f(&mut doc)
    }

    pub fn set(&self, key: &str, value: impl Into<Vec<u8>>) -> DocumentResult<()> {
        self.inner.lock().set(key, value)
    }

    pub fn remove(&self, key: &str) -> DocumentResult<bool> {
        self.inner.lock().remove(key)
    }

    pub fn get(&self, key: &str) -> DocumentResult<Option<Vec<u8>>> {
        self.inner.lock().get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().keys()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn entries(&self) -> DocumentResult<BTreeMap<String, Vec<u8>>> {
        self.inner.lock().entries()
    }

    pub fn apply(&self, delta: &[u8], origin: Origin) -> DocumentResult<usize> {
        self.inner.lock().apply(delta, origin)
    }

    pub fn encode_full_state(&self) -> Snapshot {
        self.inner.lock().encode_full_state()
    }

    pub fn heads(&self) -> Vec<ChangeHash> {
        self.inner.lock().heads()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DocumentUpdate> {
        self.inner.lock().subscribe()
    }
}

impl std::fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("document_id", &self.document_id())
            .finish()
    }
}
