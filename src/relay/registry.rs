//! Peer identity → live connection table.
//!
//! At most one connection is registered per identity. A new registration
//! replaces the old one (last writer wins) and hands the replaced connection
//! back so the caller can close it. Removal is guarded by connection id so a
//! late disconnect never removes a newer registration.

use std::sync::Arc;

use dashmap::DashMap;

use crate::net::connection::{Connection, ConnectionId};

/// Concurrent identity → connection table.
#[derive(Default)]
pub struct Registry {
    peers: DashMap<String, Arc<dyn Connection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` under `identity`, returning the connection it replaced.
    ///
    /// Re-registering the same connection returns `None`.
    #[must_use]
    pub fn register(&self, identity: &str, conn: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        let id = conn.id();
        self.peers
            .insert(identity.to_owned(), conn)
            .filter(|replaced| replaced.id() != id)
    }

    /// Current connection for `identity`.
    pub fn lookup(&self, identity: &str) -> Option<Arc<dyn Connection>> {
        self.peers.get(identity).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `identity` only if it still maps to connection `id`.
    ///
    /// Returns whether an entry was removed.
    pub fn unregister(&self, identity: &str, id: ConnectionId) -> bool {
        self.peers.remove_if(identity, |_, conn| conn.id() == id).is_some()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.peers.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("peers", &self.peers.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::memory;

    #[test]
    fn register_and_lookup() {
        let registry = Registry::new();
        let (conn, _remote) = memory::connection();

        assert!(registry.register("a", conn.clone()).is_none());
        let found = registry.lookup("a").unwrap();
        assert_eq!(found.id(), conn.id());
        assert!(registry.lookup("b").is_none());
    }

    #[test]
    fn second_registration_replaces_first() {
        let registry = Registry::new();
        let (first, _r1) = memory::connection();
        let (second, _r2) = memory::connection();

        assert!(registry.register("a", first.clone()).is_none());
        let replaced = registry.register("a", second.clone()).unwrap();

        assert_eq!(replaced.id(), first.id());
        assert_eq!(registry.lookup("a").unwrap().id(), second.id());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn re_registering_same_connection_replaces_nothing() {
        let registry = Registry::new();
        let (conn, _remote) = memory::connection();

        assert!(registry.register("a", conn.clone()).is_none());
        assert!(registry.register("a", conn.clone()).is_none());
    }

    #[test]
    fn stale_unregister_keeps_newer_entry() {
        let registry = Registry::new();
        let (old, _r1) = memory::connection();
        let (new, _r2) = memory::connection();

        let _ = registry.register("a", old.clone());
        let _ = registry.register("a", new.clone());

        assert!(!registry.unregister("a", old.id()));
        assert_eq!(registry.lookup("a").unwrap().id(), new.id());

        assert!(registry.unregister("a", new.id()));
        assert!(!registry.unregister("a", new.id()));
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registration_leaves_one_holder() {
        let registry = Arc::new(Registry::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let (conn, remote) = memory::connection();
                let replaced = registry.register("shared", conn.clone());
                (conn, remote, replaced)
            }));
        }

        let mut replaced_ids = Vec::new();
        let mut all_ids = Vec::new();
        for task in tasks {
            let (conn, _remote, replaced) = task.await.unwrap();
            all_ids.push(conn.id());
            if let Some(replaced) = replaced {
                replaced_ids.push(replaced.id());
            }
        }

        // Every registration but the surviving one was handed back exactly once.
        assert_eq!(registry.len(), 1);
        let holder = registry.lookup("shared").unwrap().id();
        assert_eq!(replaced_ids.len(), all_ids.len() - 1);
        assert!(!replaced_ids.contains(&holder));
        replaced_ids.sort_by_key(|id| id.as_u64());
        replaced_ids.dedup();
        assert_eq!(replaced_ids.len(), all_ids.len() - 1);
    }
}
