//! In-process connection used by relay tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};

use crate::net::connection::{ConnError, Connection, ConnectionId, RemoteIdentity, TransportKind};

pub(crate) struct MemoryConnection {
    id: ConnectionId,
    identity: RemoteIdentity,
    inbox: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outbox: mpsc::UnboundedSender<Bytes>,
    closed: watch::Sender<bool>,
    stalled: AtomicBool,
}

/// The far end of a [`MemoryConnection`], driven by the test.
pub(crate) struct Remote {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    closed: watch::Receiver<bool>,
}

pub(crate) fn connection() -> (Arc<MemoryConnection>, Remote) {
    let (to_relay, inbox) = mpsc::unbounded_channel();
    let (outbox, from_relay) = mpsc::unbounded_channel();
    let (closed, closed_rx) = watch::channel(false);
    let conn = Arc::new(MemoryConnection {
        id: ConnectionId::new(),
        identity: RemoteIdentity::new(),
        inbox: Mutex::new(inbox),
        outbox,
        closed,
        stalled: AtomicBool::new(false),
    });
    let remote = Remote {
        tx: Some(to_relay),
        rx: from_relay,
        closed: closed_rx,
    };
    (conn, remote)
}

impl MemoryConnection {
    /// Make every later `send` hang forever, even across `close`.
    pub(crate) fn stall_sends(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Remote {
    pub(crate) fn send(&self, frame: impl Into<Bytes>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(frame.into());
        }
    }

    /// Next frame from the relay, or `None` once the connection is closed and drained.
    pub(crate) async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = self.closed.wait_for(|c| *c) => self.rx.try_recv().ok(),
        }
    }

    pub(crate) async fn recv_timeout(&mut self, timeout: Duration) -> Option<Bytes> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    /// Wait until the relay closed the connection.
    pub(crate) async fn wait_closed(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.closed.wait_for(|c| *c))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Simulate the peer going away.
    pub(crate) fn hang_up(&mut self) {
        self.tx = None;
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn remote_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn identity(&self) -> &RemoteIdentity {
        &self.identity
    }

    async fn send(&self, frame: Bytes) -> Result<(), ConnError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        self.outbox.send(frame).map_err(|_| ConnError::Closed)
    }

    async fn receive(&self) -> Result<Bytes, ConnError> {
        let mut closed = self.closed.subscribe();
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            _ = closed.wait_for(|c| *c) => Err(ConnError::Closed),
            frame = inbox.recv() => frame.ok_or(ConnError::Closed),
        }
    }

    async fn close(&self) -> Result<(), ConnError> {
        self.closed.send_replace(true);
        Ok(())
    }
}
