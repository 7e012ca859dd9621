//! Shared utilities for relay integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use relay_server::config::ServerConfig;
use relay_server::net::TransportKind;
use relay_server::relay::{ConditionCode, Message};
use relay_server::Server;

pub const WAIT: Duration = Duration::from_secs(5);

/// A loopback port that is currently free for both TCP and UDP.
pub fn free_port() -> u16 {
    loop {
        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = tcp.local_addr().unwrap().port();
        if std::net::UdpSocket::bind(("127.0.0.1", port)).is_ok() {
            return port;
        }
    }
}

pub fn test_config(port: u16) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.address = format!("127.0.0.1:{port}");
    config.relay.handshake_timeout_secs = 2;
    config.shutdown.drain_timeout_secs = 1;
    config
}

/// Start a server with both transports on a fresh port.
pub async fn start_server() -> Server {
    let mut server = Server::new(test_config(free_port()));
    server.listen().await.unwrap();
    server
}

pub fn ws_addr(server: &Server) -> SocketAddr {
    server.local_addr(TransportKind::WebSocket).unwrap()
}

pub fn udp_addr(server: &Server) -> SocketAddr {
    server.local_addr(TransportKind::Udp).unwrap()
}

pub fn paired(peer: &str) -> Message {
    Message::Condition {
        code: ConditionCode::Paired,
        peer: peer.into(),
    }
}

pub fn transport(payload: &'static [u8]) -> Message {
    Message::Transport {
        payload: Bytes::from_static(payload),
    }
}

/// Poll `check` until it holds or [`WAIT`] passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < WAIT {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Websocket peer speaking the relay protocol.
pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (stream, _) = connect_async(format!("ws://{addr}/relay")).await.unwrap();
        Self { stream }
    }

    /// Connect and complete the identification handshake.
    pub async fn join(addr: SocketAddr, identity: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client
            .send(Message::Hello {
                identity: identity.into(),
            })
            .await;
        assert_eq!(client.recv().await, Some(Message::HelloAck));
        client
    }

    pub async fn send(&mut self, message: Message) {
        self.send_raw(message.encode()).await;
    }

    pub async fn send_raw(&mut self, frame: Bytes) {
        self.stream.send(WsMessage::binary(frame)).await.unwrap();
    }

    /// Next relay message, or `None` if the socket closed or nothing arrived.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::time::timeout(WAIT, async {
            while let Some(Ok(frame)) = self.stream.next().await {
                if let WsMessage::Binary(data) = frame {
                    return Message::parse(&data).ok();
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// Whether the relay closes the socket, ignoring frames sent before.
    pub async fn closed(&mut self) -> bool {
        tokio::time::timeout(WAIT, async {
            while let Some(Ok(_)) = self.stream.next().await {}
        })
        .await
        .is_ok()
    }

    pub async fn hang_up(mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// UDP peer speaking the relay protocol, one datagram per frame.
pub struct UdpClient {
    socket: UdpSocket,
    server: SocketAddr,
}

impl UdpClient {
    pub async fn join(server: SocketAddr, identity: &str) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut client = Self { socket, server };
        client
            .send(Message::Hello {
                identity: identity.into(),
            })
            .await;
        assert_eq!(client.recv().await, Some(Message::HelloAck));
        client
    }

    pub async fn send(&mut self, message: Message) {
        self.socket.send_to(&message.encode(), self.server).await.unwrap();
    }

    pub async fn recv(&mut self) -> Option<Message> {
        let mut buf = vec![0u8; 65_536];
        let (len, _) = tokio::time::timeout(WAIT, self.socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        Message::parse(&Bytes::copy_from_slice(&buf[..len])).ok()
    }
}
