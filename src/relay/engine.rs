//! The relay engine.
//!
//! # Responsibilities
//! - Run one task per accepted connection: identify, register, then serve
//! - Pair two registered peers into a session on request
//! - Forward payloads between session members in arrival order
//! - Tear a session down exactly once when either side fails
//! - Drain everything within a deadline on shutdown
//!
//! # Connection task
//! ```text
//! accept → handshake (Hello, bounded by handshake_timeout)
//!        → Registry::register (replaced connection closed in background)
//!        → HelloAck
//!        → read loop: Bind → pair | Transport → forward | Close → leave
//!        → release (unregister, tear down session if any)
//! ```
//!
//! Each member's read loop is the forwarding task for its direction, so a
//! session is driven by exactly two tasks and frames within one direction are
//! never reordered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;

use crate::config::{BusyPolicy, RelayConfig};
use crate::net::connection::{ConnError, Connection, ConnectionId};
use crate::net::listener::AcceptFn;
use crate::observability::metrics;
use crate::relay::messages::{ConditionCode, Message, MessageError};
use crate::relay::registry::Registry;
use crate::relay::session::{Member, Session, SessionId};
use crate::relay::tracker::ConnectionTracker;

/// Upper bound on the goodbye message sent before closing a connection.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Why a connection failed to identify itself.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("no identification frame within the handshake timeout")]
    Timeout,
    #[error("connection failed during handshake: {0}")]
    Connection(#[from] ConnError),
    #[error("malformed identification frame: {0}")]
    Malformed(#[from] MessageError),
    #[error("expected hello, got {0}")]
    Unexpected(&'static str),
    #[error("claimed identity '{claimed}' does not match transport identity '{established}'")]
    IdentityMismatch { claimed: String, established: String },
}

/// What a shutdown drain had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Sessions open when the drain started.
    pub sessions: usize,
    /// Connections still alive at the deadline and aborted.
    pub forced: usize,
}

enum Pairing {
    Paired {
        session: Arc<Session>,
        evicted: Option<Arc<Session>>,
    },
    Refused(ConditionCode),
}

/// Turns accepted connections into registered, paired, forwarding sessions.
pub struct Relay {
    registry: Registry,
    sessions: DashMap<SessionId, Arc<Session>>,
    bindings: DashMap<ConnectionId, Arc<Session>>,
    /// Serialises pairing decisions against registry removal and teardown.
    pairing: Mutex<()>,
    tracker: ConnectionTracker,
    config: RelayConfig,
    draining: AtomicBool,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
            sessions: DashMap::new(),
            bindings: DashMap::new(),
            pairing: Mutex::new(()),
            tracker: ConnectionTracker::new(),
            config,
            draining: AtomicBool::new(false),
        })
    }

    /// Callback to hand to listeners.
    pub fn acceptor(self: &Arc<Self>) -> AcceptFn {
        let relay = Arc::clone(self);
        Arc::new(move |conn: Arc<dyn Connection>| relay.accept(conn))
    }

    /// Take ownership of an accepted connection and drive it on its own task.
    pub fn accept(self: &Arc<Self>, conn: Arc<dyn Connection>) {
        if self.draining.load(Ordering::SeqCst) {
            tracing::debug!(connection_id = %conn.id(), "Relay draining, refusing connection");
            tokio::spawn(async move {
                let _ = conn.close().await;
            });
            return;
        }

        let guard = self.tracker.track(Arc::clone(&conn));
        let id = guard.id();
        let relay = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _guard = guard;
            relay.run_connection(conn).await;
        });
        self.tracker.attach(id, task.abort_handle());
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of active sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of connection tasks still running.
    pub fn connection_count(&self) -> usize {
        self.tracker.active_count()
    }

    /// Close every session and connection, waiting at most `deadline`.
    ///
    /// Whatever is still running at the deadline is aborted and its
    /// connection closed in the background.
    pub async fn close(&self, deadline: Duration) -> DrainReport {
        self.draining.store(true, Ordering::SeqCst);

        let sessions: Vec<Arc<Session>> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        let mut report = DrainReport {
            sessions: sessions.len(),
            forced: 0,
        };
        tracing::info!(
            sessions = sessions.len(),
            connections = self.tracker.active_count(),
            deadline_ms = deadline.as_millis() as u64,
            "Draining relay"
        );

        let drain = async {
            join_all(sessions.iter().map(|session| self.teardown(session))).await;
            let remaining = self.tracker.connections();
            join_all(remaining.iter().map(|conn| close_peer(conn))).await;
            self.tracker.wait_idle().await;
        };

        if tokio::time::timeout(deadline, drain).await.is_ok() {
            tracing::info!("Relay drained");
            return report;
        }

        let abandoned = self.tracker.abort_all();
        report.forced = abandoned.len();
        tracing::warn!(
            remaining = abandoned.len(),
            "Drain deadline exceeded, force-closing connections"
        );
        metrics::record_forced_closes(abandoned.len());

        for conn in abandoned {
            tokio::spawn(async move {
                let _ = conn.close().await;
            });
        }

        let _guard = self.lock_pairing();
        for entry in self.sessions.iter() {
            if entry.value().mark_closed() {
                metrics::session_closed();
            }
        }
        self.sessions.clear();
        self.bindings.clear();
        self.registry.clear();

        report
    }

    async fn run_connection(self: Arc<Self>, conn: Arc<dyn Connection>) {
        let id = conn.id();
        let identity = match self.handshake(&conn).await {
            Ok(identity) => identity,
            Err(e) => {
                metrics::record_handshake("rejected");
                tracing::debug!(
                    connection_id = %id,
                    peer_addr = %conn.remote_addr(),
                    error = %e,
                    "Handshake failed"
                );
                let _ = conn.close().await;
                return;
            }
        };
        metrics::record_handshake("accepted");

        if let Some(replaced) = self.registry.register(&identity, Arc::clone(&conn)) {
            tracing::info!(
                identity = %identity,
                replaced = %replaced.id(),
                connection_id = %id,
                "Identity re-registered, closing previous connection"
            );
            tokio::spawn(async move {
                let _ = replaced.close().await;
            });
        }
        tracing::info!(
            connection_id = %id,
            identity = %identity,
            transport = %conn.kind(),
            peer_addr = %conn.remote_addr(),
            "Peer registered"
        );

        let served = match conn.send(Message::HelloAck.encode()).await {
            Ok(()) => self.serve(&conn, &identity).await,
            Err(e) => Err(e),
        };
        match served {
            Ok(()) => tracing::debug!(connection_id = %id, "Peer said goodbye"),
            Err(e) => tracing::debug!(connection_id = %id, error = %e, "Connection ended"),
        }

        self.release(&conn, &identity).await;
    }

    async fn handshake(&self, conn: &Arc<dyn Connection>) -> Result<String, HandshakeError> {
        let frame = tokio::time::timeout(self.config.handshake_timeout(), conn.receive())
            .await
            .map_err(|_| HandshakeError::Timeout)??;

        let identity = match Message::parse(&frame)? {
            Message::Hello { identity } => identity,
            other => return Err(HandshakeError::Unexpected(other.kind())),
        };

        if !conn.identity().set(&identity) {
            return Err(HandshakeError::IdentityMismatch {
                established: conn.remote_identity().unwrap_or_default().to_owned(),
                claimed: identity,
            });
        }
        Ok(identity)
    }

    async fn serve(&self, conn: &Arc<dyn Connection>, identity: &str) -> Result<(), ConnError> {
        loop {
            let frame = conn.receive().await?;
            match Message::parse(&frame) {
                Ok(Message::Transport { payload }) => self.forward(conn, frame, payload.len()).await?,
                Ok(Message::Bind { target }) => self.pair(conn, identity, &target).await?,
                Ok(Message::Close) => return Ok(()),
                Ok(other) => tracing::debug!(
                    connection_id = %conn.id(),
                    message = other.kind(),
                    "Ignoring unexpected message"
                ),
                Err(e) => tracing::debug!(
                    connection_id = %conn.id(),
                    error = %e,
                    "Ignoring malformed frame"
                ),
            }
        }
    }

    async fn forward(&self, conn: &Arc<dyn Connection>, frame: Bytes, payload_len: usize) -> Result<(), ConnError> {
        let session = self.bindings.get(&conn.id()).map(|e| Arc::clone(e.value()));
        let Some(session) = session else {
            return report(conn, ConditionCode::NotPaired, "").await;
        };
        let Some(partner) = session.partner_of(conn.id()).map(|m| Arc::clone(&m.conn)) else {
            return Ok(());
        };

        // Both members hear `Paired` before any payload crosses.
        session.wait_open().await;
        if session.is_closed() {
            return Ok(());
        }

        if let Err(e) = partner.send(frame).await {
            tracing::debug!(
                session_id = %session.id(),
                connection_id = %partner.id(),
                error = %e,
                "Forwarding failed"
            );
            self.teardown(&session).await;
            return Err(e);
        }
        metrics::record_forwarded_bytes(payload_len);
        Ok(())
    }

    async fn pair(&self, conn: &Arc<dyn Connection>, identity: &str, target: &str) -> Result<(), ConnError> {
        let (session, evicted) = match self.try_pair(conn, identity, target) {
            Pairing::Refused(code) => {
                metrics::record_pairing(code.as_str());
                tracing::debug!(
                    connection_id = %conn.id(),
                    identity = %identity,
                    target = %target,
                    condition = code.as_str(),
                    "Pairing refused"
                );
                return report(conn, code, target).await;
            }
            Pairing::Paired { session, evicted } => (session, evicted),
        };
        metrics::record_pairing(ConditionCode::Paired.as_str());

        if let Some(evicted) = evicted {
            self.evict(&evicted, session.target().conn.id()).await;
        }

        tracing::info!(
            session_id = %session.id(),
            initiator = %identity,
            target = %target,
            "Session established"
        );

        let notified = async {
            report(conn, ConditionCode::Paired, target).await?;
            report(&session.target().conn, ConditionCode::Paired, identity).await
        };
        if let Err(e) = notified.await {
            self.teardown(&session).await;
            return Err(e);
        }
        session.open();
        Ok(())
    }

    fn try_pair(&self, conn: &Arc<dyn Connection>, identity: &str, target: &str) -> Pairing {
        if target == identity {
            return Pairing::Refused(ConditionCode::InvalidTarget);
        }

        let _guard = self.lock_pairing();
        if self.bindings.contains_key(&conn.id()) {
            return Pairing::Refused(ConditionCode::AlreadyPaired);
        }
        let Some(peer) = self.registry.lookup(target) else {
            return Pairing::Refused(ConditionCode::PeerNotFound);
        };

        let existing = self.bindings.get(&peer.id()).map(|e| Arc::clone(e.value()));
        let evicted = match existing {
            None => None,
            Some(_) if self.config.busy_policy == BusyPolicy::Reject => {
                return Pairing::Refused(ConditionCode::PeerBusy);
            }
            Some(existing) => {
                self.detach(&existing);
                if let Some(former) = existing.partner_of(peer.id()) {
                    self.registry.unregister(&former.identity, former.conn.id());
                }
                Some(existing)
            }
        };

        let session = Arc::new(Session::new(
            Member {
                identity: identity.to_owned(),
                conn: Arc::clone(conn),
            },
            Member {
                identity: target.to_owned(),
                conn: peer,
            },
        ));
        for member in session.members() {
            self.bindings.insert(member.conn.id(), Arc::clone(&session));
        }
        self.sessions.insert(session.id(), Arc::clone(&session));
        metrics::session_opened();

        Pairing::Paired { session, evicted }
    }

    /// Close the former partner of `keep` in a session `try_pair` already
    /// detached and unregistered.
    async fn evict(&self, session: &Session, keep: ConnectionId) {
        let Some(former) = session.partner_of(keep) else {
            return;
        };
        tracing::info!(
            session_id = %session.id(),
            evicted = %former.identity,
            "Evicting session partner for new pairing"
        );
        close_peer(&former.conn).await;
    }

    /// Tear a session down. Only the first caller does any work.
    async fn teardown(&self, session: &Session) {
        {
            let _guard = self.lock_pairing();
            if !self.detach(session) {
                return;
            }
            for member in session.members() {
                self.registry.unregister(&member.identity, member.conn.id());
            }
        }

        tracing::info!(
            session_id = %session.id(),
            initiator = %session.initiator().identity,
            target = %session.target().identity,
            age_ms = session.age().as_millis() as u64,
            "Session closed"
        );

        let [a, b] = session.members();
        tokio::join!(close_peer(&a.conn), close_peer(&b.conn));
    }

    /// Remove a session from the tables. Returns `false` if it was already gone.
    fn detach(&self, session: &Session) -> bool {
        if !session.mark_closed() {
            return false;
        }
        self.sessions.remove(&session.id());
        for member in session.members() {
            self.bindings
                .remove_if(&member.conn.id(), |_, bound| bound.id() == session.id());
        }
        metrics::session_closed();
        true
    }

    async fn release(&self, conn: &Arc<dyn Connection>, identity: &str) {
        let session = {
            let _guard = self.lock_pairing();
            self.registry.unregister(identity, conn.id());
            self.bindings.get(&conn.id()).map(|e| Arc::clone(e.value()))
        };

        match session {
            Some(session) => self.teardown(&session).await,
            None => {
                let _ = conn.close().await;
            }
        }
        tracing::info!(connection_id = %conn.id(), identity = %identity, "Peer disconnected");
    }

    fn lock_pairing(&self) -> MutexGuard<'_, ()> {
        self.pairing.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn report(conn: &Arc<dyn Connection>, code: ConditionCode, peer: &str) -> Result<(), ConnError> {
    conn.send(
        Message::Condition {
            code,
            peer: peer.to_owned(),
        }
        .encode(),
    )
    .await
}

/// Say goodbye at the protocol level, then close.
async fn close_peer(conn: &Arc<dyn Connection>) {
    let _ = tokio::time::timeout(CLOSE_GRACE, conn.send(Message::Close.encode())).await;
    if let Err(e) = conn.close().await {
        tracing::debug!(connection_id = %conn.id(), error = %e, "Close failed");
    }
}
