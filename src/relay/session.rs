//! A pairing of two connections.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use crate::net::connection::{Connection, ConnectionId};

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// One side of a session.
#[derive(Clone)]
pub struct Member {
    pub identity: String,
    pub conn: Arc<dyn Connection>,
}

/// Two paired connections. Each side's read loop forwards into the other.
///
/// Forwarding waits until the session is opened, which happens once both
/// members have been told they are paired, or until it is closed.
pub struct Session {
    id: SessionId,
    initiator: Member,
    target: Member,
    open: watch::Sender<bool>,
    closed: AtomicBool,
    started_at: Instant,
}

impl Session {
    pub fn new(initiator: Member, target: Member) -> Self {
        let (open, _) = watch::channel(false);
        Self {
            id: SessionId::next(),
            initiator,
            target,
            open,
            closed: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn initiator(&self) -> &Member {
        &self.initiator
    }

    pub fn target(&self) -> &Member {
        &self.target
    }

    pub fn members(&self) -> [&Member; 2] {
        [&self.initiator, &self.target]
    }

    /// The side opposite to connection `id`.
    pub fn partner_of(&self, id: ConnectionId) -> Option<&Member> {
        if self.initiator.conn.id() == id {
            Some(&self.target)
        } else if self.target.conn.id() == id {
            Some(&self.initiator)
        } else {
            None
        }
    }

    /// Let forwarding start.
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Wait until the session is opened or closed.
    pub async fn wait_open(&self) {
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| *open).await;
    }

    /// Mark the session closed. Only the first caller gets `true`.
    ///
    /// Also releases anything blocked in [`wait_open`](Session::wait_open).
    pub fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.open.send_replace(true);
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn age(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("initiator", &self.initiator.identity)
            .field("target", &self.target.identity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::memory;

    fn member(identity: &str) -> (Member, memory::Remote) {
        let (conn, remote) = memory::connection();
        (
            Member {
                identity: identity.into(),
                conn,
            },
            remote,
        )
    }

    #[test]
    fn partner_is_symmetric() {
        let (a, _ra) = member("a");
        let (b, _rb) = member("b");
        let (a_id, b_id) = (a.conn.id(), b.conn.id());
        let session = Session::new(a, b);

        assert_eq!(session.partner_of(a_id).unwrap().identity, "b");
        assert_eq!(session.partner_of(b_id).unwrap().identity, "a");
        assert!(session.partner_of(ConnectionId::new()).is_none());
    }

    #[tokio::test]
    async fn forwarding_gate_opens_on_open_or_close() {
        let (a, _ra) = member("a");
        let (b, _rb) = member("b");
        let session = Arc::new(Session::new(a, b));

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.wait_open().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        session.open();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        let (c, _rc) = member("c");
        let (d, _rd) = member("d");
        let closing = Session::new(c, d);
        assert!(closing.mark_closed());
        tokio::time::timeout(std::time::Duration::from_secs(1), closing.wait_open())
            .await
            .unwrap();
    }

    #[test]
    fn closes_once() {
        let (a, _ra) = member("a");
        let (b, _rb) = member("b");
        let session = Session::new(a, b);

        assert!(!session.is_closed());
        assert!(session.mark_closed());
        assert!(!session.mark_closed());
        assert!(session.is_closed());
    }
}
