//! Connection status fan-out with replay of the last known value.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use super::ConnectionStatus;

/// Callback invoked on every status transition
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

#[derive(Default)]
struct SinkState {
    last: Option<ConnectionStatus>,
    callback: Option<StatusCallback>,
}

/// Per-board status sink.
///
/// Outlives individual sessions so that a UI registered against a board keeps
/// receiving transitions across teardown and re-creation.
#[derive(Default)]
pub struct StatusSink {
    state: Mutex<SinkState>,
}

impl StatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status; the callback only fires when the value changes
    pub fn report(&self, status: ConnectionStatus) {
        let callback = {
            let mut state = self.state.lock();
            if state.last == Some(status) {
                return;
            }
            state.last = Some(status);
            state.callback.clone()
        };

        debug!("Connection status -> {:?}", status);
        if let Some(callback) = callback {
            callback(status);
        }
    }

    /// Replace the callback. A new callback immediately receives the last known status.
    pub fn set_callback(&self, callback: Option<StatusCallback>) {
        let replay = {
            let mut state = self.state.lock();
            state.callback = callback.clone();
            state.last
        };

        if let (Some(callback), Some(status)) = (callback, replay) {
            callback(status);
        }
    }

    pub fn current(&self) -> Option<ConnectionStatus> {
        self.state.lock().last
    }
}

impl std::fmt::Debug for StatusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusSink")
            .field("last", &self.current())
            .finish()
    }
}
