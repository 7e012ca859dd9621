//! Server coordinator: binds every transport, then shuts them down in order.
//!
//! # Responsibilities
//! - Bind the websocket and UDP listeners concurrently on the shared address
//! - Report every bind failure, keeping the listeners that did bind
//! - Two-phase close: stop admission on all listeners, then drain the relay
//!   within the configured deadline

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::net::listener::{BoundListener, Listener, ListenerError};
use crate::net::tls;
use crate::net::udp::UdpListener;
use crate::net::websocket::WsListener;
use crate::net::TransportKind;
use crate::relay::{DrainReport, Relay};

/// Time allowed for listener tasks to return after `close`.
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Error type for server lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// One or more listeners failed to bind.
    #[error("Listen failed: {}", join_errors(.0))]
    Listen(Vec<ListenerError>),
    /// One or more listeners failed to close.
    #[error("Close failed: {}", join_errors(.0))]
    Close(Vec<ListenerError>),
}

impl ServerError {
    pub fn errors(&self) -> &[ListenerError] {
        match self {
            ServerError::Listen(errors) | ServerError::Close(errors) => errors,
        }
    }
}

fn join_errors(errors: &[ListenerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Owns the relay engine and the listeners feeding it.
pub struct Server {
    config: ServerConfig,
    relay: Arc<Relay>,
    listeners: Vec<BoundListener>,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let relay = Relay::new(config.relay.clone());
        Self {
            config,
            relay,
            listeners: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Listeners that bound successfully and are serving.
    pub fn listeners(&self) -> &[BoundListener] {
        &self.listeners
    }

    /// Bound address of the listener for `kind`, if it is running.
    pub fn local_addr(&self, kind: TransportKind) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|bound| bound.kind == kind)
            .map(|bound| bound.local_addr)
    }

    /// Bind all listeners concurrently and start serving on each.
    ///
    /// Returns once every listener has bound or failed. Listeners that bound
    /// keep serving even when a sibling failed; the caller decides whether
    /// partial availability is acceptable.
    pub async fn listen(&mut self) -> Result<(), ServerError> {
        let listener_config = &self.config.listener;
        let address = listener_config.address.as_str();

        let websocket = async {
            let tls = tls::load_optional(listener_config.tls.as_ref())
                .await
                .map_err(ListenerError::Tls)?;
            WsListener::bind(address, tls, listener_config.max_frame_bytes).await
        };
        let udp = UdpListener::bind(address, self.config.udp.clone());

        let (websocket, udp) = tokio::join!(websocket, udp);

        let mut errors = Vec::new();
        match websocket {
            Ok(listener) => {
                let local_addr = listener.local_addr();
                self.start(TransportKind::WebSocket, local_addr, Arc::new(listener));
            }
            Err(e) => errors.push(e),
        }
        match udp {
            Ok(listener) => {
                let local_addr = listener.local_addr();
                self.start(TransportKind::Udp, local_addr, Arc::new(listener));
            }
            Err(e) => errors.push(e),
        }

        for e in &errors {
            tracing::error!(error = %e, "Listener failed to start");
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ServerError::Listen(errors))
        }
    }

    fn start(&mut self, kind: TransportKind, local_addr: SocketAddr, listener: Arc<dyn Listener>) {
        let accept = self.relay.acceptor();
        let serving = Arc::clone(&listener);
        let task = tokio::spawn(async move {
            if let Err(e) = serving.listen(accept).await {
                tracing::error!(transport = %kind, error = %e, "Listener failed");
            }
        });

        tracing::info!(transport = %kind, address = %local_addr, "Listening for connections");
        self.listeners.push(BoundListener {
            kind,
            local_addr,
            listener,
        });
        self.tasks.push(task);
    }

    /// Stop admission on every listener, then drain the relay.
    ///
    /// Listener tasks are awaited after the drain: the UDP listener keeps
    /// delivering to peers it already accepted until they have all closed.
    /// Bounded by the drain deadline plus a short listener stop window.
    /// Sessions forced closed at the deadline are reported in the
    /// [`DrainReport`], not as an error.
    pub async fn close(&mut self) -> Result<DrainReport, ServerError> {
        tracing::info!(listeners = self.listeners.len(), "Closing listeners");
        let results = join_all(self.listeners.iter().map(|bound| bound.listener.close())).await;
        let errors: Vec<ListenerError> = results.into_iter().filter_map(Result::err).collect();
        for e in &errors {
            tracing::error!(error = %e, "Listener failed to close");
        }

        let deadline = self.config.shutdown.drain_timeout();
        let report = self.relay.close(deadline).await;
        if report.forced > 0 {
            tracing::warn!(
                forced = report.forced,
                sessions = report.sessions,
                "Shutdown deadline exceeded"
            );
        }

        let mut tasks = std::mem::take(&mut self.tasks);
        if tokio::time::timeout(LISTENER_STOP_TIMEOUT, join_all(tasks.iter_mut()))
            .await
            .is_err()
        {
            tracing::warn!("Listener tasks did not stop in time, aborting");
            for task in &tasks {
                task.abort();
            }
        }
        self.listeners.clear();

        if errors.is_empty() {
            Ok(report)
        } else {
            Err(ServerError::Close(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn config_on(address: &str) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.listener.address = address.to_owned();
        config.shutdown.drain_timeout_secs = 1;
        config
    }

    #[test]
    fn aggregated_errors_are_joined() {
        let err = ServerError::Listen(vec![
            ListenerError::AlreadyStarted(TransportKind::WebSocket),
            ListenerError::Tls(io::Error::new(io::ErrorKind::NotFound, "missing cert")),
        ]);
        let rendered = err.to_string();
        assert!(rendered.starts_with("Listen failed: "));
        assert!(rendered.contains("websocket listener already started; "));
        assert!(rendered.contains("missing cert"));
    }

    #[tokio::test]
    async fn binds_both_transports() {
        let mut server = Server::new(config_on("127.0.0.1:0"));
        server.listen().await.unwrap();

        // Each transport picks its own ephemeral port when asked for port 0.
        assert!(server.local_addr(TransportKind::WebSocket).is_some());
        assert!(server.local_addr(TransportKind::Udp).is_some());
        assert_eq!(server.listeners().len(), 2);

        let report = server.close().await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert!(server.listeners().is_empty());
    }

    #[tokio::test]
    async fn bad_address_fails_every_listener() {
        let mut server = Server::new(config_on("not-an-address"));
        let err = server.listen().await.unwrap_err();
        assert_eq!(err.errors().len(), 2);
        assert!(server.listeners().is_empty());
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn missing_tls_material_only_fails_websocket() {
        let mut config = config_on("127.0.0.1:0");
        config.listener.tls = Some(crate::config::TlsConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
        });
        let mut server = Server::new(config);

        let err = server.listen().await.unwrap_err();
        assert!(matches!(err.errors(), [ListenerError::Tls(_)]));
        assert!(server.local_addr(TransportKind::WebSocket).is_none());
        assert!(server.local_addr(TransportKind::Udp).is_some());
        server.close().await.unwrap();
    }
}
