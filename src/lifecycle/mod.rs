//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (server.rs):
//!     Server::listen → bind websocket + UDP concurrently → serve each on its own task
//!
//! Shutdown (server.rs):
//!     Signal received → close listeners → drain relay (deadline) → force-close rest
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → trigger graceful shutdown
//!     second signal during shutdown → exit immediately (main)
//! ```
//!
//! # Design Decisions
//! - Bind failures are collected per listener, never fail-fast
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has a deadline: remaining connections are aborted after it

pub mod server;
pub mod signals;

pub use server::{Server, ServerError};
pub use signals::shutdown_signal;
