//! Live connection tracking for graceful shutdown.
//!
//! # Responsibilities
//! - Track every connection task the relay has spawned
//! - Let shutdown enumerate live connections and wait for them to finish
//! - Abort whatever is still running when the drain deadline passes

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::net::connection::{Connection, ConnectionId};

struct Tracked {
    conn: Arc<dyn Connection>,
    task: Option<AbortHandle>,
}

/// Tracks connection tasks. Uses a watch channel to signal when the count changes.
#[derive(Clone)]
pub struct ConnectionTracker {
    live: Arc<DashMap<ConnectionId, Tracked>>,
    count: Arc<watch::Sender<usize>>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            live: Arc::new(DashMap::new()),
            count: Arc::new(tx),
        }
    }

    /// Record a new connection. Returns a guard that untracks it on drop.
    pub fn track(&self, conn: Arc<dyn Connection>) -> ConnectionGuard {
        let id = conn.id();
        self.live.insert(id, Tracked { conn, task: None });
        self.count.send_modify(|n| *n += 1);
        ConnectionGuard {
            tracker: self.clone(),
            id,
        }
    }

    /// Attach the task driving `id` so it can be aborted.
    ///
    /// No-op if the task already finished.
    pub fn attach(&self, id: ConnectionId, task: AbortHandle) {
        if let Some(mut tracked) = self.live.get_mut(&id) {
            tracked.task = Some(task);
        }
    }

    /// Get current live connection count.
    pub fn active_count(&self) -> usize {
        *self.count.borrow()
    }

    /// Snapshot of live connections.
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.live.iter().map(|entry| Arc::clone(&entry.conn)).collect()
    }

    /// Wait until every tracked connection is gone.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Abort every tracked task, returning the affected connections.
    pub fn abort_all(&self) -> Vec<Arc<dyn Connection>> {
        // Snapshot first: an aborted task's guard removes itself from `live`.
        let snapshot: Vec<_> = self
            .live
            .iter()
            .map(|entry| (Arc::clone(&entry.conn), entry.task.clone()))
            .collect();

        snapshot
            .into_iter()
            .map(|(conn, task)| {
                if let Some(task) = task {
                    task.abort();
                }
                conn
            })
            .collect()
    }

    fn untrack(&self, id: ConnectionId) {
        if self.live.remove(&id).is_some() {
            self.count.send_modify(|n| *n = n.saturating_sub(1));
            tracing::trace!(connection_id = %id, "Connection untracked");
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
/// Untracks the connection when dropped, including when its task is aborted.
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.untrack(self.id);
    }
}
