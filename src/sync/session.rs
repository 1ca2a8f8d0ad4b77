//! Per-board synchronization session.
//!
//! A session wires one [`BoardDocument`] to one relay subscription and one snapshot
//! store binding. All of its state transitions run on a single worker task:
//!
//! ```text
//!  created --(load snapshot)--> initializing --(channel opened)--> active
//!  initializing --(subscribe failed or timed out)--> degraded
//!  active --(local edit)--> active            broadcast delta, restart debounce
//!  active --(interval)--> active              unconditional save
//!  active --(transport error)--> degraded     status: disconnected
//!  degraded --(network online)--> active      fresh subscription, connected on confirm
//!  active|degraded --(destroy)--> draining --(final save)--> terminated
//! ```
//!
//! Saves never overlap. A trigger that fires while a save is in flight is remembered
//! and runs as soon as the in-flight save finishes. Subscribe attempts run as a
//! stored future beside the timers, bounded by `subscribe_timeout`, so a stalled
//! relay never holds up saves or teardown.

use futures_util::future::BoxFuture;
use std::future::pending;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::document::{BoardDocument, DocumentHandle, DocumentUpdate};
use super::presence::{PresenceMap, PresenceRecord};
use super::status::StatusSink;
use super::{ConnectionStatus, DocumentId, Origin, SyncConfig, SyncResult, MIN_TIMER};
use crate::relay::{RelayChannel, RelayError, RelayEvent, RelayKind, RelayMessage, RelayTransport};
use crate::storage::{SnapshotStore, StorageResult};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Loading the stored snapshot and opening the first subscription
    Initializing,
    /// Holding a relay subscription (confirmed or awaiting confirmation)
    Active,
    /// No usable subscription; waiting for a network-online signal
    Degraded,
    /// Teardown requested; final save in progress
    Draining,
    Terminated,
}

enum SessionCommand {
    NetworkOnline,
    PublishPresence(PresenceRecord),
    Destroy(oneshot::Sender<()>),
}

type SubscribeFuture = BoxFuture<'static, Result<RelayChannel, RelayError>>;

/// Handle to a running session
pub struct SyncSession {
    document_id: DocumentId,
    document: DocumentHandle,
    presence: Arc<PresenceMap>,
    status: Arc<StatusSink>,
    phase: watch::Receiver<SessionPhase>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    rejected: Arc<AtomicUsize>,
}

impl SyncSession {
    /// Construct the session and start its worker.
    ///
    /// Returns immediately; [`ready`](Self::ready) resolves once the stored snapshot
    /// is applied and the first subscribe attempt has succeeded, failed or timed out.
    pub fn spawn(
        document_id: impl Into<String>,
        store: Arc<dyn SnapshotStore>,
        transport: Arc<dyn RelayTransport>,
        status: Arc<StatusSink>,
        config: SyncConfig,
    ) -> Self {
        let document_id = document_id.into();
        let document = DocumentHandle::new(BoardDocument::new(document_id.clone()));
        let updates = document.subscribe();
        let presence = Arc::new(PresenceMap::new(document_id.clone()));
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Initializing);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let rejected = Arc::new(AtomicUsize::new(0));

        let worker = SessionWorker {
            document_id: document_id.clone(),
            document: document.clone(),
            presence: presence.clone(),
            status: status.clone(),
            store,
            transport,
            config,
            phase: phase_tx,
            commands: command_rx,
            updates,
            channel: None,
            subscribing: None,
            rejected: rejected.clone(),
            local_presence: None,
            debounce_deadline: None,
            save_task: None,
            save_pending: false,
        };
        tokio::spawn(worker.run());

        Self {
            document_id,
            document,
            presence,
            status,
            phase: phase_rx,
            commands: command_tx,
            rejected,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn document(&self) -> &DocumentHandle {
        &self.document
    }

    /// Remote participants' presence
    pub fn presence(&self) -> &Arc<PresenceMap> {
        &self.presence
    }

    pub fn status(&self) -> Option<ConnectionStatus> {
        self.status.current()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// Relay payloads dropped because they failed to decode or merge
    pub fn rejected_payloads(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Wait for initialization to finish
    pub async fn ready(&self) {
        let mut phase = self.phase.clone();
        let _ = phase.wait_for(|p| *p != SessionPhase::Initializing).await;
    }

    /// Publish this participant's presence. Re-published after every reconnect.
    pub fn set_local_presence(&self, record: PresenceRecord) {
        let _ = self.commands.send(SessionCommand::PublishPresence(record));
    }

    /// Connectivity may be back; resubscribe if the session is degraded
    pub fn notify_network_online(&self) {
        let _ = self.commands.send(SessionCommand::NetworkOnline);
    }

    /// Stop timers, run the final save, release the subscription and presence state.
    ///
    /// Resolves only after the final save has completed.
    pub async fn destroy(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(SessionCommand::Destroy(tx)).is_ok() {
            let _ = rx.await;
        }

        let mut phase = self.phase.clone();
        let _ = phase.wait_for(|p| *p == SessionPhase::Terminated).await;
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("document_id", &self.document_id)
            .field("phase", &self.phase())
            .field("status", &self.status())
            .finish()
    }
}

struct SessionWorker {
    document_id: DocumentId,
    document: DocumentHandle,
    presence: Arc<PresenceMap>,
    status: Arc<StatusSink>,
    store: Arc<dyn SnapshotStore>,
    transport: Arc<dyn RelayTransport>,
    config: SyncConfig,
    phase: watch::Sender<SessionPhase>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    updates: mpsc::UnboundedReceiver<DocumentUpdate>,
    channel: Option<RelayChannel>,
    subscribing: Option<SubscribeFuture>,
    rejected: Arc<AtomicUsize>,
    local_presence: Option<PresenceRecord>,
    debounce_deadline: Option<Instant>,
    save_task: Option<JoinHandle<StorageResult<()>>>,
    save_pending: bool,
}

impl SessionWorker {
    async fn run(mut self) {
        self.status.report(ConnectionStatus::Disconnected);

        // The snapshot must be in the document before the first live delta can arrive
        self.load_snapshot().await;
        self.begin_subscribe();

        let period = self.config.save_interval.max(MIN_TIMER);
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reply = loop {
            let debounce = self.debounce_deadline;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Destroy(reply)) => break Some(reply),
                    Some(SessionCommand::NetworkOnline) => self.on_network_online(),
                    Some(SessionCommand::PublishPresence(record)) => self.publish_presence(record),
                    // Every handle is gone; drain anyway so nothing is lost
                    None => break None,
                },
                Some(update) = self.updates.recv() => self.on_document_update(update),
                result = await_subscribe(&mut self.subscribing) => self.on_subscribed(result),
                event = next_relay_event(&mut self.channel) => self.on_relay_event(event),
                _ = sleep_until(debounce) => {
                    self.debounce_deadline = None;
                    self.request_save("debounce");
                }
                _ = interval.tick() => self.request_save("interval"),
                result = join_save(&mut self.save_task) => self.on_save_finished(result),
            }
        };

        self.drain().await;

        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    async fn load_snapshot(&mut self) {
        match self.store.load(&self.document_id).await {
            Ok(Some(snapshot)) => match self.document.apply(&snapshot, Origin::Remote) {
                Ok(_) => info!(
                    "Loaded snapshot for {} ({} bytes)",
                    self.document_id,
                    snapshot.len()
                ),
                Err(e) => warn!("Ignoring unreadable snapshot for {}: {}", self.document_id, e),
            },
            Ok(None) => info!("No snapshot for {}, starting empty", self.document_id),
            Err(e) => warn!(
                "Failed to load snapshot for {}, starting empty: {}",
                self.document_id, e
            ),
        }
    }

    fn begin_subscribe(&mut self) {
        let transport = self.transport.clone();
        let document_id = self.document_id.clone();
        let limit = self.config.subscribe_timeout.max(MIN_TIMER);

        self.subscribing = Some(Box::pin(async move {
            let attempt = time::timeout(limit, transport.subscribe(&document_id)).await;
            match attempt {
                Ok(result) => result,
                Err(_) => Err(RelayError::Subscribe(
                    document_id,
                    format!("timed out after {:?}", limit),
                )),
            }
        }));
    }

    fn on_subscribed(&mut self, result: Result<RelayChannel, RelayError>) {
        self.subscribing = None;
        match result {
            Ok(channel) => {
                debug!("Subscription opened for {}", self.document_id);
                self.channel = Some(channel);
                self.set_phase(SessionPhase::Active);
            }
            Err(e) => {
                warn!("Relay subscribe failed for {}: {}", self.document_id, e);
                self.status.report(ConnectionStatus::Disconnected);
                self.set_phase(SessionPhase::Degraded);
            }
        }
    }

    fn on_network_online(&mut self) {
        if self.channel.is_some() {
            debug!("Network online for {}, subscription still held", self.document_id);
            return;
        }
        if self.subscribing.is_some() {
            debug!("Network online for {}, subscribe already in progress", self.document_id);
            return;
        }

        info!("Network online, resubscribing {}", self.document_id);
        self.begin_subscribe();
    }

    fn on_document_update(&mut self, update: DocumentUpdate) {
        if update.origin == Origin::Remote {
            return;
        }

        self.publish(RelayKind::Delta, update.delta.to_vec());
        self.debounce_deadline = Some(Instant::now() + self.config.debounce);
    }

    fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Subscribed => {
                info!("Relay subscription confirmed for {}", self.document_id);
                self.status.report(ConnectionStatus::Connected);
                self.announce();
            }
            RelayEvent::Message(message) => {
                let kind = message.kind;
                if let Err(e) = self.on_relay_message(message) {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Dropping malformed {:?} payload for {}: {}",
                        kind, self.document_id, e
                    );
                }
            }
            RelayEvent::Error(reason) => {
                warn!("Relay error for {}: {}", self.document_id, reason);
                self.mark_disconnected();
            }
            RelayEvent::Closed => {
                warn!("Relay closed for {}", self.document_id);
                self.mark_disconnected();
            }
        }
    }

    fn on_relay_message(&mut self, message: RelayMessage) -> SyncResult<()> {
        match message.kind {
            RelayKind::Delta => {
                self.document.apply(&message.payload, Origin::Remote)?;
            }
            RelayKind::Presence => {
                self.presence.apply_encoded(&message.payload)?;
            }
        }
        Ok(())
    }

    /// Push full state and our presence to a freshly confirmed subscription.
    ///
    /// Covers edits made while no channel was held; peers merge it idempotently.
    fn announce(&mut self) {
        let state = self.document.encode_full_state();
        self.publish(RelayKind::Delta, state);

        if let Some(record) = self.local_presence.clone() {
            self.publish_encoded_presence(&record);
        }
    }

    fn publish_presence(&mut self, record: PresenceRecord) {
        self.publish_encoded_presence(&record);
        self.local_presence = Some(record);
    }

    fn publish_encoded_presence(&mut self, record: &PresenceRecord) {
        match record.encode() {
            Ok(payload) => self.publish(RelayKind::Presence, payload),
            Err(e) => warn!("Failed to encode presence for {}: {}", self.document_id, e),
        }
    }

    fn publish(&mut self, kind: RelayKind, payload: Vec<u8>) {
        let Some(channel) = &self.channel else {
            debug!("{:?} for {} not relayed, no subscription", kind, self.document_id);
            return;
        };

        if let Err(e) = channel.publish(kind, payload) {
            warn!("Relay publish failed for {}: {}", self.document_id, e);
            self.mark_disconnected();
        }
    }

    /// The current subscription is dead; drop it and wait for a network signal
    fn mark_disconnected(&mut self) {
        self.channel = None;
        self.status.report(ConnectionStatus::Disconnected);
        self.set_phase(SessionPhase::Degraded);
    }

    fn request_save(&mut self, trigger: &str) {
        if self.save_task.is_some() {
            debug!("Save for {} deferred ({}), one in flight", self.document_id, trigger);
            self.save_pending = true;
            return;
        }
        self.start_save(trigger);
    }

    fn start_save(&mut self, trigger: &str) {
        debug!("Saving {} ({})", self.document_id, trigger);
        let snapshot = self.document.encode_full_state();
        let store = self.store.clone();
        let document_id = self.document_id.clone();

        self.save_task = Some(tokio::spawn(async move {
            store.save(&document_id, &snapshot).await
        }));
    }

    fn on_save_finished(&mut self, result: Result<StorageResult<()>, JoinError>) {
        self.save_task = None;
        self.log_save(result);

        if std::mem::take(&mut self.save_pending) {
            self.start_save("deferred");
        }
    }

    fn log_save(&self, result: Result<StorageResult<()>, JoinError>) {
        match result {
            Ok(Ok(())) => debug!("Saved {}", self.document_id),
            Ok(Err(e)) => error!("Failed to save {}: {}", self.document_id, e),
            Err(e) => error!("Save task for {} failed: {}", self.document_id, e),
        }
    }

    async fn drain(&mut self) {
        self.set_phase(SessionPhase::Draining);
        self.subscribing = None;
        self.debounce_deadline = None;
        self.save_pending = false;

        if let Some(task) = self.save_task.take() {
            let result = task.await;
            self.log_save(result);
        }

        let snapshot = self.document.encode_full_state();
        match self.store.save(&self.document_id, &snapshot).await {
            Ok(()) => info!("Final save for {} complete", self.document_id),
            Err(e) => error!("Final save for {} failed: {}", self.document_id, e),
        }

        self.channel = None;
        self.status.report(ConnectionStatus::Disconnected);
        self.presence.clear();
        self.local_presence = None;

        self.set_phase(SessionPhase::Terminated);
        info!("Session for {} terminated", self.document_id);
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.phase.send_replace(phase);
    }
}

async fn next_relay_event(channel: &mut Option<RelayChannel>) -> RelayEvent {
    match channel {
        Some(channel) => channel.next_event().await,
        None => pending().await,
    }
}

async fn await_subscribe(
    subscribing: &mut Option<SubscribeFuture>,
) -> Result<RelayChannel, RelayError> {
    match subscribing {
        Some(attempt) => attempt.await,
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn join_save(
    task: &mut Option<JoinHandle<StorageResult<()>>>,
) -> Result<StorageResult<()>, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => pending().await,
    }
}
