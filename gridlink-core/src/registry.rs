//! Connection registry
//!
//! Sole authority for the node-id → active-connection mapping. At most one
//! active connection per peer id: registering a new session for a peer
//! supersedes and closes the previous one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::connection::Connection;
use crate::types::NodeId;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<NodeId, Arc<Connection>>>,
    next_seq: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a session sequence number, unique across the registry's
    /// lifetime
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a connection under its peer id, superseding and closing any
    /// previous session for that peer. Returns the superseded connection.
    pub fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let prev = self
            .connections
            .write()
            .insert(conn.peer().to_string(), conn.clone());
        if let Some(ref old) = prev {
            info!(
                peer = conn.peer(),
                old_seq = old.seq(),
                new_seq = conn.seq(),
                "superseding stale connection"
            );
            old.close();
        }
        prev
    }

    pub fn get(&self, peer: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(peer).cloned()
    }

    /// Remove a connection, but only if it is still the active session for
    /// its peer. A stale session cannot evict its successor.
    pub fn remove(&self, conn: &Connection) -> bool {
        let mut map = self.connections.write();
        match map.get(conn.peer()) {
            Some(current) if current.seq() == conn.seq() => {
                map.remove(conn.peer());
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.connections.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WireFormat;
    use tokio::sync::mpsc;

    fn conn(registry: &ConnectionRegistry, peer: &str) -> Arc<Connection> {
        let (tx, _rx) = mpsc::channel(4);
        Arc::new(Connection::new(
            peer.to_string(),
            registry.next_seq(),
            WireFormat::Json,
            tx,
        ))
    }

    #[test]
    fn test_register_and_get() {
        let registry = ConnectionRegistry::new();
        let c = conn(&registry, "CS001");
        assert!(registry.register(c.clone()).is_none());
        assert_eq!(registry.get("CS001").unwrap().seq(), c.seq());
        assert!(registry.get("CS002").is_none());
    }

    #[test]
    fn test_reconnect_supersedes() {
        let registry = ConnectionRegistry::new();
        let first = conn(&registry, "CS001");
        let second = conn(&registry, "CS001");

        registry.register(first.clone());
        let prev = registry.register(second.clone());

        assert_eq!(prev.unwrap().seq(), first.seq());
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.get("CS001").unwrap().seq(), second.seq());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_remove_is_noop() {
        let registry = ConnectionRegistry::new();
        let first = conn(&registry, "CS001");
        let second = conn(&registry, "CS001");

        registry.register(first.clone());
        registry.register(second.clone());

        // The superseded session's cleanup must not evict its successor
        assert!(!registry.remove(&first));
        assert!(registry.get("CS001").is_some());

        assert!(registry.remove(&second));
        assert!(registry.get("CS001").is_none());
    }
}
