//! Registry of live connections, at most one per identity.

use crate::delivery::channel::Channel;
use crate::delivery::session::SessionPhase;
use crate::types::{ConnectionId, Identity};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One identity bound to one duplex channel.
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    channel: Arc<dyn Channel>,
    phase: Mutex<SessionPhase>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    pub(crate) fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock() = phase;
    }

    /// Whether live submissions may be pushed to this connection.
    pub fn is_live(&self) -> bool {
        self.phase() == SessionPhase::Live
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Maps each identity to its single live connection.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Identity, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Install `channel` as the live connection for `identity`.
    ///
    /// Returns the new connection and the one it superseded, if any. The
    /// caller is responsible for closing the superseded channel.
    pub fn register(
        &self,
        identity: Identity,
        channel: Arc<dyn Channel>,
    ) -> (Arc<Connection>, Option<Arc<Connection>>) {
        let connection = Arc::new(Connection {
            id: ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            identity: identity.clone(),
            channel,
            phase: Mutex::new(SessionPhase::Connecting),
        });

        let superseded = self
            .connections
            .write()
            .insert(identity, Arc::clone(&connection));

        (connection, superseded)
    }

    pub fn lookup(&self, identity: &Identity) -> Option<Arc<Connection>> {
        self.connections.read().get(identity).cloned()
    }

    /// Whether `id` is still the registered connection for `identity`.
    pub fn is_current(&self, identity: &Identity, id: ConnectionId) -> bool {
        self.connections
            .read()
            .get(identity)
            .map_or(false, |c| c.id == id)
    }

    /// Remove the mapping only if `id` is still the registered connection.
    ///
    /// An unregister for an old connection that arrives after a newer one
    /// replaced it leaves the newer one in place.
    pub fn unregister(&self, identity: &Identity, id: ConnectionId) -> bool {
        let mut connections = self.connections.write();
        match connections.get(identity) {
            Some(current) if current.id == id => {
                connections.remove(identity);
                true
            }
            _ => false,
        }
    }

    /// Remove and return every connection.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.connections.write().drain().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::channel::MemoryChannel;

    fn channel() -> Arc<dyn Channel> {
        let (channel, _receiver) = MemoryChannel::pair(4);
        Arc::new(channel)
    }

    fn alice() -> Identity {
        Identity::new("alice").unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        assert!(registry.lookup(&alice()).is_none());

        let (connection, superseded) = registry.register(alice(), channel());
        assert!(superseded.is_none());
        assert_eq!(registry.lookup(&alice()).unwrap().id(), connection.id());
        assert_eq!(connection.phase(), SessionPhase::Connecting);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_supersedes_previous() {
        let registry = ConnectionRegistry::new();
        let (first, _) = registry.register(alice(), channel());
        let (second, superseded) = registry.register(alice(), channel());

        assert_eq!(superseded.unwrap().id(), first.id());
        assert!(registry.is_current(&alice(), second.id()));
        assert!(!registry.is_current(&alice(), first.id()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_late_unregister_does_not_remove_newer() {
        let registry = ConnectionRegistry::new();
        let (first, _) = registry.register(alice(), channel());
        let (second, _) = registry.register(alice(), channel());

        assert!(!registry.unregister(&alice(), first.id()));
        assert_eq!(registry.lookup(&alice()).unwrap().id(), second.id());

        assert!(registry.unregister(&alice(), second.id()));
        assert!(registry.is_empty());
    }
}
