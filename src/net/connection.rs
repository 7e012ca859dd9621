//! Transport-agnostic connection capability set.
//!
//! # Responsibilities
//! - Define what the relay engine needs from any accepted connection
//! - Generate unique connection IDs for tracing and guarded unregister
//! - Hold the remote identity once the handshake has established it
//!
//! # Contract
//! - `receive` yields whole frames only; never a partial frame
//! - `close` is idempotent and unblocks any in-flight `send`/`receive`,
//!   which then fail with [`ConnError::Closed`]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use async_trait::async_trait;
use bytes::Bytes;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Wire transport a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Streamed, upgrade-capable transport (websocket over HTTP, optionally TLS).
    WebSocket,
    /// Message-oriented datagram transport.
    Udp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Udp => "udp",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set-once holder for the identity a peer proved or claimed.
#[derive(Debug, Default)]
pub struct RemoteIdentity(OnceLock<String>);

impl RemoteIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// The identity, if the handshake has completed.
    pub fn get(&self) -> Option<&str> {
        self.0.get().map(String::as_str)
    }

    /// Record the identity. Returns `false` if a different identity was already set.
    pub fn set(&self, identity: &str) -> bool {
        let stored = self.0.get_or_init(|| identity.to_owned());
        stored == identity
    }
}

/// Errors surfaced by connection I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// The connection was closed, locally or by the remote end.
    #[error("connection closed")]
    Closed,

    /// Nothing arrived within the transport's idle window.
    #[error("connection timed out")]
    Timeout,

    /// Frame exceeds what the transport can carry.
    #[error("frame of {0} bytes is too large")]
    FrameTooLarge(usize),

    /// Underlying socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Websocket protocol error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),
}

/// An open bidirectional channel to one remote party.
///
/// Implementations must be usable from several tasks at once: one task may
/// be blocked in [`receive`](Connection::receive) while others call
/// [`send`](Connection::send) or [`close`](Connection::close).
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Process-unique id of this connection.
    fn id(&self) -> ConnectionId;

    /// Transport this connection arrived on.
    fn kind(&self) -> TransportKind;

    /// Remote socket address.
    fn remote_addr(&self) -> SocketAddr;

    /// Identity slot, empty until the handshake completes.
    fn identity(&self) -> &RemoteIdentity;

    /// Convenience accessor for the established identity.
    fn remote_identity(&self) -> Option<&str> {
        self.identity().get()
    }

    /// Send one frame.
    async fn send(&self, frame: Bytes) -> Result<(), ConnError>;

    /// Wait for the next whole frame.
    async fn receive(&self) -> Result<Bytes, ConnError>;

    /// Close the connection. Calling it again is a no-op.
    async fn close(&self) -> Result<(), ConnError>;
}
