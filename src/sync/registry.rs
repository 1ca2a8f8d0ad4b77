//! Board registry for session lifecycle.
//!
//! This module provides:
//! - The single creation path for sessions (`ensure`)
//! - Read-only lookups that never construct (`get`, `get_document`)
//! - Teardown that removes the entry immediately and blocks re-creation until the
//!   final save has finished
//! - Per-board connection status sinks that outlive individual sessions

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, info};

use super::document::DocumentHandle;
use super::session::SyncSession;
use super::status::{StatusCallback, StatusSink};
use super::{DocumentId, SyncConfig};
use crate::relay::RelayTransport;
use crate::storage::SnapshotStore;

type PendingTeardown = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<DocumentId, Arc<SyncSession>>,
    tearing_down: HashMap<DocumentId, PendingTeardown>,
    status_sinks: HashMap<DocumentId, Arc<StatusSink>>,
}

impl RegistryState {
    fn status_sink(&mut self, document_id: &str) -> Arc<StatusSink> {
        self.status_sinks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(StatusSink::new()))
            .clone()
    }
}

/// Owner of every live synchronization session
pub struct BoardRegistry {
    store: Arc<dyn SnapshotStore>,
    transport: Arc<dyn RelayTransport>,
    config: SyncConfig,
    state: Arc<Mutex<RegistryState>>,
    constructed: AtomicUsize,
}

impl BoardRegistry {
    pub fn new(store: Arc<dyn SnapshotStore>, transport: Arc<dyn RelayTransport>) -> Self {
        Self::with_config(store, transport, SyncConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn SnapshotStore>,
        transport: Arc<dyn RelayTransport>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            state: Arc::new(Mutex::new(RegistryState::default())),
            constructed: AtomicUsize::new(0),
        }
    }

    /// Start the session for a board, or return the running one.
    ///
    /// This is the only place sessions are constructed. Resolves once the stored
    /// snapshot has been applied. Returns `None` while a teardown for the same id is
    /// in flight, or if the session was destroyed before it became ready.
    pub async fn ensure(&self, document_id: &str) -> Option<Arc<SyncSession>> {
        let session = {
            let mut state = self.state.lock();

            if state.tearing_down.contains_key(document_id) {
                debug!("Ignoring ensure for {}, teardown in flight", document_id);
                return None;
            }

            match state.sessions.get(document_id) {
                Some(existing) => existing.clone(),
                None => {
                    let status = state.status_sink(document_id);
                    let session = Arc::new(SyncSession::spawn(
                        document_id,
                        self.store.clone(),
                        self.transport.clone(),
                        status,
                        self.config.clone(),
                    ));
                    state.sessions.insert(document_id.to_string(), session.clone());
                    self.constructed.fetch_add(1, Ordering::SeqCst);

                    info!("Created session for {}", document_id);
                    session
                }
            }
        };

        session.ready().await;

        let still_registered = self
            .state
            .lock()
            .sessions
            .get(document_id)
            .is_some_and(|current| Arc::ptr_eq(current, &session));

        still_registered.then_some(session)
    }

    /// Start or no-op a session, for callers that only need persistence running
    pub async fn ensure_persistence(&self, document_id: &str) {
        self.ensure(document_id).await;
    }

    /// Current session, if any. Never constructs.
    pub fn get(&self, document_id: &str) -> Option<Arc<SyncSession>> {
        self.state.lock().sessions.get(document_id).cloned()
    }

    /// Current document handle, if any. Never constructs.
    pub fn get_document(&self, document_id: &str) -> Option<DocumentHandle> {
        self.get(document_id).map(|session| session.document().clone())
    }

    /// Register (or clear) the status callback for a board.
    ///
    /// The sink belongs to the registry, not the session, so a callback survives
    /// teardown and re-creation. A new callback is immediately replayed the last
    /// known status.
    pub fn connection_status_sink(&self, document_id: &str, callback: Option<StatusCallback>) {
        let sink = self.state.lock().status_sink(document_id);
        sink.set_callback(callback);
    }

    /// Tear down the session for a board.
    ///
    /// The entry is removed before this returns, so `get` reads `None` at once and
    /// `ensure` refuses the id until the returned future resolves. Teardown runs on
    /// its own task: dropping the future does not cancel it.
    pub fn destroy(&self, document_id: &str) -> Teardown {
        let mut state = self.state.lock();

        if let Some(pending) = state.tearing_down.get(document_id) {
            return Teardown(Some(pending.clone()));
        }

        let Some(session) = state.sessions.remove(document_id) else {
            debug!("Destroy for {} ignored, no session", document_id);
            return Teardown(None);
        };

        info!("Destroying session for {}", document_id);

        let registry_state = self.state.clone();
        let id = document_id.to_string();
        // Blocks on the registry lock until the pending mark below is inserted
        let task = tokio::spawn(async move {
            session.destroy().await;
            registry_state.lock().tearing_down.remove(&id);
            info!("Teardown complete for {}", id);
        });

        let pending = async move {
            let _ = task.await;
        }
        .boxed()
        .shared();

        state
            .tearing_down
            .insert(document_id.to_string(), pending.clone());

        Teardown(Some(pending))
    }

    /// Tear down every session, including ones already tearing down
    pub async fn destroy_all(&self) {
        let ids: Vec<DocumentId> = {
            let state = self.state.lock();
            state
                .sessions
                .keys()
                .chain(state.tearing_down.keys())
                .cloned()
                .collect()
        };

        info!("Destroying {} sessions", ids.len());
        join_all(ids.iter().map(|id| self.destroy(id))).await;
    }

    /// Connectivity is back; every degraded session resubscribes once
    pub fn notify_network_online(&self) {
        let sessions: Vec<Arc<SyncSession>> = self.state.lock().sessions.values().cloned().collect();
        for session in sessions {
            session.notify_network_online();
        }
    }

    pub fn is_pending_teardown(&self, document_id: &str) -> bool {
        self.state.lock().tearing_down.contains_key(document_id)
    }

    /// Live sessions
    pub fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of live sessions, sorted
    pub fn document_ids(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self.state.lock().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Sessions constructed over the registry's lifetime
    pub fn sessions_constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for BoardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardRegistry")
            .field("sessions", &self.document_ids())
            .field("constructed", &self.sessions_constructed())
            .finish()
    }
}

/// Completion of a registry teardown. Resolves after the final save.
#[must_use = "a board is only closed once its teardown has been awaited"]
pub struct Teardown(Option<PendingTeardown>);

impl Future for Teardown {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.0.as_mut() {
            Some(pending) => pending.poll_unpin(cx),
            None => Poll::Ready(()),
        }
    }
}
