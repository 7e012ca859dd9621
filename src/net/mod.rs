//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! websocket.rs: TCP → [TLS] → HTTP upgrade → WsConnection ─┐
//!                                                          ├→ AcceptFn → relay engine
//! udp.rs:       UDP socket → demux by source address ──────┘
//!                            → UdpConnection
//! ```
//!
//! # Design Decisions
//! - The relay only sees `dyn Connection` and `dyn Listener`; a new transport
//!   is added by implementing both, never by branching in the relay
//! - Transport framing stays in this layer
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
#[cfg(test)]
pub(crate) mod memory;
pub mod tls;
pub mod udp;
pub mod websocket;

pub use connection::{ConnError, Connection, ConnectionId, RemoteIdentity, TransportKind};
pub use listener::{AcceptFn, BoundListener, Listener, ListenerError};
