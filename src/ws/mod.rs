pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod handshake;
pub mod protocol;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use uuid::Uuid;

pub use broadcast::BroadcastReport;

/// Identity slot of a live connection in the registry.
pub type ConnectionId = Uuid;

/// Sender half of a connection's bounded outbound queue.
/// The connection's writer task owns the socket sink and drains this queue.
pub type ConnectionSender = mpsc::Sender<axum::extract::ws::Message>;

/// Registry of live WebSocket connections.
///
/// One mutex guards the whole membership map so `broadcast` sees a consistent
/// snapshot. Membership is owned by the connection's read loop: it adds itself
/// on start and removes itself on exit; nothing else removes entries.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    members: Arc<Mutex<HashMap<ConnectionId, ConnectionSender>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: ConnectionId, sender: ConnectionSender) {
        let count = {
            let mut members = self.lock();
            members.insert(id, sender);
            members.len()
        };
        tracing::debug!(connection_id = %id, connections = count, "Connection registered");
    }

    /// Returns whether the connection was present.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let (removed, count) = {
            let mut members = self.lock();
            let removed = members.remove(&id).is_some();
            (removed, members.len())
        };
        tracing::debug!(connection_id = %id, connections = count, "Connection unregistered");
        removed
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionSender>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
