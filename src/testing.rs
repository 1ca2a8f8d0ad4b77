//! Test doubles for sessions and the registry.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::relay::{RelayChannel, RelayEndpoint, RelayError, RelayEvent, RelayMessage, RelayTransport};
use crate::storage::{MemoryStore, SnapshotStore, StorageError, StorageResult};
use crate::sync::Snapshot;

/// Let spawned tasks run. Advances paused time by a few milliseconds.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Transport whose subscriptions are driven by the test
pub struct ScriptedTransport {
    endpoints: Mutex<Vec<RelayEndpoint>>,
    auto_confirm: bool,
    fail_subscribe: AtomicBool,
    hang_subscribe: AtomicBool,
    attempts: AtomicUsize,
}

impl ScriptedTransport {
    /// Every subscription is confirmed immediately
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_confirm(true))
    }

    /// Subscriptions stay unconfirmed until the test emits `Subscribed`
    pub fn manual() -> Arc<Self> {
        Arc::new(Self::with_confirm(false))
    }

    fn with_confirm(auto_confirm: bool) -> Self {
        Self {
            endpoints: Mutex::new(Vec::new()),
            auto_confirm,
            fail_subscribe: AtomicBool::new(false),
            hang_subscribe: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Subscribe calls made while set never resolve
    pub fn hang_subscribe(&self, hang: bool) {
        self.hang_subscribe.store(hang, Ordering::SeqCst);
    }

    /// Subscribe calls made so far, including failed and hung ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful subscriptions opened so far
    pub fn subscriptions(&self) -> usize {
        self.endpoints.lock().len()
    }

    /// Report an event on the `index`th subscription
    pub fn emit(&self, index: usize, event: RelayEvent) -> bool {
        self.endpoints.lock()[index].report(event)
    }

    /// Drain what the session published on the `index`th subscription
    pub fn published(&self, index: usize) -> Vec<RelayMessage> {
        let mut endpoints = self.endpoints.lock();
        let mut messages = Vec::new();
        while let Ok(message) = endpoints[index].outbound.try_recv() {
            messages.push(message);
        }
        messages
    }
}

#[async_trait]
impl RelayTransport for ScriptedTransport {
    async fn subscribe(&self, document_id: &str) -> Result<RelayChannel, RelayError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.hang_subscribe.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(RelayError::Subscribe(document_id.to_string(), "refused".into()));
        }

        let (channel, endpoint) = RelayChannel::pair();
        if self.auto_confirm {
            endpoint.report(RelayEvent::Subscribed);
        }
        self.endpoints.lock().push(endpoint);
        Ok(channel)
    }
}

/// Snapshot store with injectable latency and failures
#[derive(Default)]
pub struct TestStore {
    inner: MemoryStore,
    save_delay: Mutex<Duration>,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    loads: AtomicUsize,
    saves_completed: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl TestStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_save_delay(&self, delay: Duration) {
        *self.save_delay.lock() = delay;
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn saves_completed(&self) -> usize {
        self.saves_completed.load(Ordering::SeqCst)
    }

    /// Highest number of saves observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Current row, read without touching the counters
    pub async fn stored(&self, document_id: &str) -> Option<Snapshot> {
        self.inner.load(document_id).await.ok().flatten()
    }
}

#[async_trait]
impl SnapshotStore for TestStore {
    async fn load(&self, document_id: &str) -> StorageResult<Option<Snapshot>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StorageError::Remote("permission denied".into()));
        }
        self.inner.load(document_id).await
    }

    async fn save(&self, document_id: &str, snapshot: &[u8]) -> StorageResult<()> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.save_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Remote("write rejected".into()));
        }
        self.inner.save(document_id, snapshot).await?;
        self.saves_completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
