//! Message-oriented transport over a single UDP socket.
//!
//! Each remote address becomes one [`UdpConnection`] on its first datagram.
//! There is no per-client stream underneath, so a connection ends when the
//! relay closes it, when the peer says goodbye at the relay protocol level,
//! or when it stays silent for the configured idle window.
//!
//! `close` stops admission only. Datagrams from addresses that already have
//! a connection keep being delivered so the relay can drain them; datagrams
//! from new addresses are dropped. The receive loop ends, and the socket is
//! released, once the last accepted connection has closed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, Notify};

use crate::config::UdpConfig;
use crate::net::connection::{ConnError, Connection, ConnectionId, RemoteIdentity, TransportKind};
use crate::net::listener::{bind_error, parse_address, AcceptFn, Listener, ListenerError};
use crate::observability::metrics;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

const KIND: TransportKind = TransportKind::Udp;

type PeerTable = DashMap<SocketAddr, Arc<UdpConnection>>;

/// UDP listener that demultiplexes datagrams by source address.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    peers: Arc<PeerTable>,
    /// Signalled whenever a connection leaves `peers`.
    departed: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    config: UdpConfig,
}

impl UdpListener {
    pub async fn bind(address: &str, config: UdpConfig) -> Result<Self, ListenerError> {
        let addr = parse_address(KIND, address)?;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| bind_error(KIND, address, e))?;
        let local_addr = socket.local_addr().map_err(|e| bind_error(KIND, address, e))?;

        tracing::info!(address = %local_addr, "UDP listener bound");

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            peers: Arc::new(DashMap::new()),
            departed: Arc::new(Notify::new()),
            shutdown,
            started: AtomicBool::new(false),
            config,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of remote addresses with a live connection.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn dispatch(&self, datagram: Bytes, from: SocketAddr, accept: &AcceptFn, admit: bool) {
        if let Some(conn) = self.peers.get(&from).map(|entry| Arc::clone(entry.value())) {
            conn.deliver(datagram);
            return;
        }
        if !admit {
            tracing::debug!(peer_addr = %from, "UDP listener closed, dropping datagram from new peer");
            return;
        }

        let conn = Arc::new(UdpConnection::new(
            from,
            Arc::clone(&self.socket),
            Arc::downgrade(&self.peers),
            Arc::clone(&self.departed),
            &self.config,
        ));
        conn.deliver(datagram);
        self.peers.insert(from, Arc::clone(&conn));

        tracing::debug!(connection_id = %conn.id, peer_addr = %from, "UDP peer accepted");
        metrics::record_connection_accepted(KIND);
        accept(conn);
    }
}

#[async_trait]
impl Listener for UdpListener {
    async fn listen(&self, accept: AcceptFn) -> Result<(), ListenerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ListenerError::AlreadyStarted(KIND));
        }

        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];

        loop {
            let closing = *shutdown.borrow_and_update();
            if closing && self.peers.is_empty() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed(), if !closing => {}
                _ = self.departed.notified(), if closing => {}
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        self.dispatch(Bytes::copy_from_slice(&buf[..len]), from, &accept, !closing);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "UDP receive failed");
                    }
                },
            }
        }

        tracing::info!(address = %self.local_addr, "UDP listener stopped");
        Ok(())
    }

    async fn close(&self) -> Result<(), ListenerError> {
        self.shutdown.send_replace(true);
        Ok(())
    }
}

/// The datagram flow from one remote address.
pub struct UdpConnection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    identity: RemoteIdentity,
    socket: Arc<UdpSocket>,
    inbox_tx: mpsc::Sender<Bytes>,
    inbox: Mutex<mpsc::Receiver<Bytes>>,
    peers: Weak<PeerTable>,
    departed: Arc<Notify>,
    closed: watch::Sender<bool>,
    idle_timeout: Duration,
}

impl UdpConnection {
    fn new(
        remote_addr: SocketAddr,
        socket: Arc<UdpSocket>,
        peers: Weak<PeerTable>,
        departed: Arc<Notify>,
        config: &UdpConfig,
    ) -> Self {
        let (inbox_tx, inbox) = mpsc::channel(config.queue_depth.max(1));
        let (closed, _) = watch::channel(false);
        Self {
            id: ConnectionId::new(),
            remote_addr,
            identity: RemoteIdentity::new(),
            socket,
            inbox_tx,
            inbox: Mutex::new(inbox),
            peers,
            departed,
            closed,
            idle_timeout: config.idle_timeout(),
        }
    }

    fn deliver(&self, datagram: Bytes) {
        match self.inbox_tx.try_send(datagram) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(connection_id = %self.id, "UDP inbox full, dropping datagram");
                metrics::record_datagram_dropped();
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[async_trait]
impl Connection for UdpConnection {
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
        if frame.len() > MAX_DATAGRAM_BYTES {
            return Err(ConnError::FrameTooLarge(frame.len()));
        }
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(ConnError::Closed);
        }

        tokio::select! {
            _ = closed.wait_for(|c| *c) => Err(ConnError::Closed),
            sent = self.socket.send_to(&frame, self.remote_addr) => sent.map(|_| ()).map_err(ConnError::from),
        }
    }

    async fn receive(&self) -> Result<Bytes, ConnError> {
        let mut closed = self.closed.subscribe();
        let mut inbox = tokio::select! {
            _ = closed.wait_for(|c| *c) => return Err(ConnError::Closed),
            inbox = self.inbox.lock() => inbox,
        };

        tokio::select! {
            _ = closed.wait_for(|c| *c) => Err(ConnError::Closed),
            datagram = inbox.recv() => datagram.ok_or(ConnError::Closed),
            _ = tokio::time::sleep(self.idle_timeout) => Err(ConnError::Timeout),
        }
    }

    async fn close(&self) -> Result<(), ConnError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        if let Some(peers) = self.peers.upgrade() {
            peers.remove_if(&self.remote_addr, |_, conn| conn.id == self.id);
        }
        self.departed.notify_one();
        Ok(())
    }
}
