//! Streamed transport: websocket over HTTP, optionally TLS.
//!
//! # Data Flow
//! ```text
//! TCP (pre-bound) → [TLS via rustls] → axum router → GET /relay upgrade
//!     → WsConnection (binary messages are frames) → accept callback
//! ```
//!
//! # Design Decisions
//! - The socket is bound in `bind` so errors surface before `listen` runs
//! - Shutdown goes through the axum-server handle; upgraded sockets are
//!   detached from the HTTP connection and are not affected by it
//! - Text messages are ignored, ping/pong is answered by the websocket layer

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{watch, Mutex};
use tower_http::trace::TraceLayer;

use crate::net::connection::{ConnError, Connection, ConnectionId, RemoteIdentity, TransportKind};
use crate::net::listener::{bind_error, parse_address, AcceptFn, Listener, ListenerError};
use crate::observability::metrics;

/// HTTP path clients upgrade on.
pub const RELAY_PATH: &str = "/relay";

/// Upper bound on the close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

const KIND: TransportKind = TransportKind::WebSocket;

/// Websocket listener bound to one TCP address.
pub struct WsListener {
    local_addr: SocketAddr,
    socket: StdMutex<Option<std::net::TcpListener>>,
    tls: Option<RustlsConfig>,
    handle: Handle,
    closed: AtomicBool,
    max_frame_bytes: usize,
}

impl WsListener {
    /// Bind the TCP socket. TLS is applied when `tls` is provided.
    pub async fn bind(
        address: &str,
        tls: Option<RustlsConfig>,
        max_frame_bytes: usize,
    ) -> Result<Self, ListenerError> {
        let addr = parse_address(KIND, address)?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| bind_error(KIND, address, e))?;
        let local_addr = listener.local_addr().map_err(|e| bind_error(KIND, address, e))?;
        let socket = listener.into_std().map_err(|e| bind_error(KIND, address, e))?;

        tracing::info!(
            address = %local_addr,
            tls = tls.is_some(),
            "Websocket listener bound"
        );

        Ok(Self {
            local_addr,
            socket: StdMutex::new(Some(socket)),
            tls,
            handle: Handle::new(),
            closed: AtomicBool::new(false),
            max_frame_bytes,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn router(&self, accept: AcceptFn) -> Router {
        Router::new()
            .route(RELAY_PATH, get(upgrade))
            .with_state(UpgradeState {
                accept,
                max_frame_bytes: self.max_frame_bytes,
            })
            .layer(TraceLayer::new_for_http())
    }
}

#[async_trait]
impl Listener for WsListener {
    async fn listen(&self, accept: AcceptFn) -> Result<(), ListenerError> {
        let socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(socket) = socket else {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            return Err(ListenerError::AlreadyStarted(KIND));
        };

        let app = self.router(accept).into_make_service_with_connect_info::<SocketAddr>();
        let served = match self.tls.clone() {
            Some(tls) => {
                axum_server::tls_rustls::from_tcp_rustls(socket, tls)
                    .handle(self.handle.clone())
                    .serve(app)
                    .await
            }
            None => {
                axum_server::from_tcp(socket)
                    .handle(self.handle.clone())
                    .serve(app)
                    .await
            }
        };

        served.map_err(|source| ListenerError::Transport {
            transport: KIND,
            source,
        })?;

        tracing::info!(address = %self.local_addr, "Websocket listener stopped");
        Ok(())
    }

    async fn close(&self) -> Result<(), ListenerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.handle.shutdown();
        // Never started: drop the socket here.
        drop(self.socket.lock().unwrap_or_else(PoisonError::into_inner).take());
        Ok(())
    }
}

#[derive(Clone)]
struct UpgradeState {
    accept: AcceptFn,
    max_frame_bytes: usize,
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<UpgradeState>,
) -> Response {
    ws.max_message_size(state.max_frame_bytes)
        .max_frame_size(state.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            let conn = WsConnection::new(socket, remote);
            tracing::debug!(connection_id = %conn.id(), peer_addr = %remote, "Websocket upgraded");
            metrics::record_connection_accepted(KIND);
            (state.accept)(Arc::new(conn));
        })
}

/// One upgraded websocket.
pub struct WsConnection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    identity: RemoteIdentity,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
    closed: watch::Sender<bool>,
}

impl WsConnection {
    pub fn new(socket: WebSocket, remote_addr: SocketAddr) -> Self {
        let (sink, stream) = socket.split();
        let (closed, _) = watch::channel(false);
        Self {
            id: ConnectionId::new(),
            remote_addr,
            identity: RemoteIdentity::new(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed,
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        KIND
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn identity(&self) -> &RemoteIdentity {
        &self.identity
    }

    async fn send(&self, frame: Bytes) -> Result<(), ConnError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(ConnError::Closed);
        }

        tokio::select! {
            _ = closed.wait_for(|c| *c) => Err(ConnError::Closed),
            sent = async {
                let mut sink = self.sink.lock().await;
                sink.send(Message::Binary(frame)).await
            } => sent.map_err(ConnError::from),
        }
    }

    async fn receive(&self) -> Result<Bytes, ConnError> {
        let mut closed = self.closed.subscribe();
        let mut stream = tokio::select! {
            _ = closed.wait_for(|c| *c) => return Err(ConnError::Closed),
            stream = self.stream.lock() => stream,
        };

        loop {
            let next = tokio::select! {
                _ = closed.wait_for(|c| *c) => return Err(ConnError::Closed),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(Message::Binary(frame))) => return Ok(frame),
                Some(Ok(Message::Close(_))) | None => {
                    self.closed.send_replace(true);
                    return Err(ConnError::Closed);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&self) -> Result<(), ConnError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        // A send blocked on the sink observes `closed` and releases the lock.
        let goodbye = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, goodbye).await {
            Ok(Err(e)) => tracing::debug!(connection_id = %self.id, error = %e, "Close handshake failed"),
            Err(_) => tracing::debug!(connection_id = %self.id, "Close handshake timed out"),
            Ok(Ok(())) => {}
        }
        Ok(())
    }
}
