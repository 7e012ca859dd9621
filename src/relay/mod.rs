//! Relay engine subsystem.
//!
//! # Data Flow
//! ```text
//! Listener ─AcceptFn─→ Relay::accept
//!     → handshake (messages.rs: Hello / HelloAck)
//!     → registry.rs (identity → connection, last writer wins)
//!     → Bind → session.rs (two members, closed once)
//!     → Transport frames forwarded member → member
//!     → teardown: unregister both, close both
//!
//! Shutdown:
//!     Relay::close → tear down sessions → close lone connections
//!     → tracker.rs wait_idle (deadline) → abort the rest
//! ```
//!
//! # Design Decisions
//! - The engine only sees `dyn Connection`; transports never leak in here
//! - Pairing decisions and teardown are serialised by one short lock;
//!   forwarding itself never takes it
//! - Condition replies (not found, busy, ...) never close the requester

pub mod engine;
pub mod messages;
pub mod registry;
pub mod session;
pub mod tracker;

pub use engine::{DrainReport, HandshakeError, Relay};
pub use messages::{ConditionCode, Message, MessageError};
pub use registry::Registry;
pub use session::{Session, SessionId};
pub use tracker::ConnectionTracker;
