//! Listener abstraction shared by every transport.
//!
//! # Responsibilities
//! - Define the two operations the server needs from a transport: run the
//!   accept loop, and stop it
//! - Hand each established connection to the relay through one callback
//!
//! # Design Decisions
//! - Binding happens in each transport's constructor so the server can bind
//!   all of them concurrently and report failures per listener
//! - `close` stops admission only; accepted connections belong to the relay

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::net::connection::{Connection, TransportKind};

/// Callback invoked once per established connection.
///
/// Must not block: the relay spawns its own task per connection.
pub type AcceptFn = Arc<dyn Fn(Arc<dyn Connection>) + Send + Sync>;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("{transport} listener failed to bind {address}: {source}")]
    Bind {
        transport: TransportKind,
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS material could not be loaded.
    #[error("failed to load TLS material: {0}")]
    Tls(#[source] std::io::Error),

    /// The transport failed while accepting.
    #[error("{transport} listener failed: {source}")]
    Transport {
        transport: TransportKind,
        #[source]
        source: std::io::Error,
    },

    /// `listen` was called more than once.
    #[error("{0} listener already started")]
    AlreadyStarted(TransportKind),
}

/// A transport listener.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept connections until closed, invoking `accept` for each one.
    ///
    /// Returning after [`close`](Listener::close) is `Ok(())`.
    async fn listen(&self, accept: AcceptFn) -> Result<(), ListenerError>;

    /// Stop accepting and release the bound resource.
    async fn close(&self) -> Result<(), ListenerError>;
}

/// A listener that has acquired its network resource.
pub struct BoundListener {
    pub kind: TransportKind,
    pub local_addr: SocketAddr,
    pub listener: Arc<dyn Listener>,
}

impl std::fmt::Debug for BoundListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundListener")
            .field("kind", &self.kind)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

pub(crate) fn bind_error(transport: TransportKind, address: &str, source: std::io::Error) -> ListenerError {
    ListenerError::Bind {
        transport,
        address: address.to_owned(),
        source,
    }
}

pub(crate) fn parse_address(transport: TransportKind, address: &str) -> Result<SocketAddr, ListenerError> {
    address.parse().map_err(|e| {
        bind_error(
            transport,
            address,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        )
    })
}
