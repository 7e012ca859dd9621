//! Rendezvous relay server library.
//!
//! Peers behind NAT connect over websocket (optionally TLS) or UDP, identify
//! themselves, and ask to be paired with another peer by identity. Once
//! paired, the relay forwards opaque payloads between them until either side
//! goes away.

// Core subsystems
pub mod config;
pub mod net;
pub mod relay;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::ServerConfig;
pub use lifecycle::Server;
pub use relay::Relay;
