//! In-process [`Link`] for tests.
//!
//! A [`LoopbackLink`] records every event sent while "connected" and
//! rejects sends with [`LinkError::NotConnected`] otherwise. Clones share
//! state, so a test can keep one handle while the code under test owns
//! another.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use parley_proto::event::ClientEvent;

use super::{Link, LinkError};

#[derive(Debug, Default)]
struct Shared {
    connected: AtomicBool,
    sent: Mutex<Vec<ClientEvent>>,
}

/// Recording link with a switchable connection state.
#[derive(Debug, Clone, Default)]
pub struct LoopbackLink {
    shared: Arc<Shared>,
}

impl LoopbackLink {
    /// Creates a link that starts connected or disconnected.
    #[must_use]
    pub fn new(connected: bool) -> Self {
        let link = Self::default();
        link.set_connected(connected);
        link
    }

    /// Flips the connection state.
    pub fn set_connected(&self, connected: bool) {
        self.shared.connected.store(connected, Ordering::SeqCst);
    }

    /// Events sent so far, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<ClientEvent> {
        self.shared.sent.lock().clone()
    }

    /// Drains and returns the recorded events.
    pub fn take_sent(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.shared.sent.lock())
    }
}

impl Link for LoopbackLink {
    fn send(&self, event: &ClientEvent) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.shared.sent.lock().push(event.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}
