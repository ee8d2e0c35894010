//! Connection registry
//!
//! Bidirectional `server_id <-> connection` bookkeeping shared by every
//! connection task. A connection is present in both maps exactly when it has
//! completed its handshake.

use crate::session::{ConnectionId, PeerConnection};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Result of `ConnectionRegistry::register_with`
#[derive(Debug)]
pub enum Registration {
    /// No previous connection for this server id
    Inserted,
    /// The previous connection was displaced and is no longer registered
    Replaced(Arc<PeerConnection>),
    /// The existing connection was preferred; the new one was not registered
    Kept(Arc<PeerConnection>),
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    by_server: DashMap<String, Arc<PeerConnection>>,
    by_connection: DashMap<ConnectionId, String>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection` under `server_id`, last registration wins
    ///
    /// Returns the displaced connection, if any.
    pub fn register(&self, server_id: &str, connection: Arc<PeerConnection>) -> Option<Arc<PeerConnection>> {
        match self.register_with(server_id, connection, |_| false) {
            Registration::Replaced(previous) => Some(previous),
            Registration::Inserted | Registration::Kept(_) => None,
        }
    }

    /// Register `connection` unless `keep_existing` prefers the current one
    ///
    /// `keep_existing` runs while the server id's entry is locked, so the
    /// decision and the update happen as one step.
    pub fn register_with<F>(
        &self,
        server_id: &str,
        connection: Arc<PeerConnection>,
        keep_existing: F,
    ) -> Registration
    where
        F: FnOnce(&PeerConnection) -> bool,
    {
        match self.by_server.entry(server_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().id() == connection.id() {
                    return Registration::Inserted;
                }
                if keep_existing(entry.get()) {
                    return Registration::Kept(entry.get().clone());
                }
                self.by_connection.insert(connection.id(), server_id.to_string());
                let previous = entry.insert(connection);
                self.by_connection.remove(&previous.id());
                Registration::Replaced(previous)
            }
            Entry::Vacant(entry) => {
                self.by_connection.insert(connection.id(), server_id.to_string());
                entry.insert(connection);
                Registration::Inserted
            }
        }
    }

    /// Remove the pair for `connection`; no-op if it never registered
    pub fn unregister(&self, connection: &PeerConnection) -> Option<String> {
        let (_, server_id) = self.by_connection.remove(&connection.id())?;
        self.by_server
            .remove_if(&server_id, |_, current| current.id() == connection.id());
        Some(server_id)
    }

    pub fn get(&self, server_id: &str) -> Option<Arc<PeerConnection>> {
        self.by_server.get(server_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.by_server.contains_key(server_id)
    }

    pub fn server_id_of(&self, connection: &PeerConnection) -> Option<String> {
        self.by_connection
            .get(&connection.id())
            .map(|entry| entry.value().clone())
    }

    /// Snapshot of every registered connection except `exclude`
    pub fn all_except(&self, exclude: Option<&str>) -> Vec<(String, Arc<PeerConnection>)> {
        self.by_server
            .iter()
            .filter(|entry| exclude != Some(entry.key().as_str()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Sorted ids of all registered servers
    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.by_server.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.by_server.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_server.is_empty()
    }

    /// Remove everything, returning the connections that were registered
    pub fn drain(&self) -> Vec<Arc<PeerConnection>> {
        let connections: Vec<Arc<PeerConnection>> = self
            .by_server
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connection in &connections {
            self.unregister(connection);
        }
        connections
    }

    /// True when both maps describe the same relation
    pub fn is_consistent(&self) -> bool {
        let forward: Vec<(String, ConnectionId)> = self
            .by_server
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().id()))
            .collect();
        let reverse: Vec<(ConnectionId, String)> = self
            .by_connection
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        forward.len() == reverse.len()
            && forward
                .iter()
                .all(|(server_id, id)| reverse.iter().any(|(rid, rsid)| rid == id && rsid == server_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Direction;
    use std::net::SocketAddr;
    use tokio_util::sync::CancellationToken;

    fn connection(root: &CancellationToken) -> Arc<PeerConnection> {
        let addr: SocketAddr = "127.0.0.1:25100".parse().unwrap();
        PeerConnection::new(addr, Direction::Inbound, root).0
    }

    #[test]
    fn test_register_and_lookup() {
        let root = CancellationToken::new();
        let registry = ConnectionRegistry::new();
        let conn = connection(&root);

        assert!(registry.register("B", conn.clone()).is_none());
        assert_eq!(registry.get("B").unwrap().id(), conn.id());
        assert_eq!(registry.server_id_of(&conn).as_deref(), Some("B"));
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_last_registration_wins() {
        let root = CancellationToken::new();
        let registry = ConnectionRegistry::new();
        let first = connection(&root);
        let second = connection(&root);

        registry.register("B", first.clone());
        let displaced = registry.register("B", second.clone()).unwrap();
        assert_eq!(displaced.id(), first.id());
        assert_eq!(registry.get("B").unwrap().id(), second.id());
        assert!(registry.server_id_of(&first).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.is_consistent());

        // The displaced connection closing must not evict its successor
        assert!(registry.unregister(&first).is_none());
        assert_eq!(registry.get("B").unwrap().id(), second.id());
    }

    #[test]
    fn test_register_with_keeps_existing() {
        let root = CancellationToken::new();
        let registry = ConnectionRegistry::new();
        let first = connection(&root);
        let second = connection(&root);

        registry.register("B", first.clone());
        match registry.register_with("B", second.clone(), |_| true) {
            Registration::Kept(existing) => assert_eq!(existing.id(), first.id()),
            other => panic!("unexpected registration {:?}", other),
        }
        assert!(registry.server_id_of(&second).is_none());
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let root = CancellationToken::new();
        let registry = ConnectionRegistry::new();
        assert!(registry.unregister(&connection(&root)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_all_except() {
        let root = CancellationToken::new();
        let registry = ConnectionRegistry::new();
        for id in ["A", "B", "C"] {
            registry.register(id, connection(&root));
        }

        let mut ids: Vec<String> = registry
            .all_except(Some("B"))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["A", "C"]);
        assert_eq!(registry.all_except(None).len(), 3);
        assert_eq!(registry.server_ids(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_drain() {
        let root = CancellationToken::new();
        let registry = ConnectionRegistry::new();
        registry.register("A", connection(&root));
        registry.register("B", connection(&root));

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_concurrent_register_unregister_stays_consistent() {
        let root = CancellationToken::new();
        let registry = Arc::new(ConnectionRegistry::new());

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                let root = root.clone();
                std::thread::spawn(move || {
                    let mut held: Vec<Arc<PeerConnection>> = Vec::new();
                    for i in 0..2000usize {
                        let server_id = format!("s{}", (i * 7 + worker) % 5);
                        let conn = connection(&root);
                        registry.register(&server_id, conn.clone());
                        if i % 3 == 0 {
                            registry.unregister(&conn);
                        } else {
                            held.push(conn);
                        }
                        if held.len() > 4 {
                            let old = held.remove(0);
                            registry.unregister(&old);
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert!(registry.is_consistent());
        assert!(registry.len() <= 5);
    }
}
