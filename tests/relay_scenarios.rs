//! End-to-end relay behaviour over real listeners.

use std::time::Duration;

use relay_server::relay::{ConditionCode, Message};

mod common;

use common::{eventually, paired, start_server, transport, udp_addr, ws_addr, UdpClient, WsClient};

#[tokio::test]
async fn websocket_peers_pair_and_forward() {
    let mut server = start_server().await;
    let addr = ws_addr(&server);

    let mut x = WsClient::join(addr, "x").await;
    let mut y = WsClient::join(addr, "y").await;

    y.send(Message::Bind { target: "x".into() }).await;
    assert_eq!(x.recv().await, Some(paired("y")));
    assert_eq!(y.recv().await, Some(paired("x")));

    x.send(transport(b"P1")).await;
    assert_eq!(y.recv().await, Some(transport(b"P1")));
    y.send(transport(b"P2")).await;
    assert_eq!(x.recv().await, Some(transport(b"P2")));

    x.hang_up().await;
    assert_eq!(y.recv().await, Some(Message::Close));
    assert!(y.closed().await);

    let relay = server.relay().clone();
    assert!(eventually(|| relay.peer_count() == 0 && relay.session_count() == 0).await);
    server.close().await.unwrap();
}

#[tokio::test]
async fn websocket_and_udp_peers_pair() {
    let mut server = start_server().await;

    let mut ws = WsClient::join(ws_addr(&server), "browser").await;
    let mut udp = UdpClient::join(udp_addr(&server), "device").await;

    udp.send(Message::Bind {
        target: "browser".into(),
    })
    .await;
    assert_eq!(ws.recv().await, Some(paired("device")));
    assert_eq!(udp.recv().await, Some(paired("browser")));

    for payload in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        ws.send(Message::Transport {
            payload: bytes::Bytes::copy_from_slice(payload),
        })
        .await;
    }
    for payload in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        assert_eq!(
            udp.recv().await,
            Some(Message::Transport {
                payload: bytes::Bytes::copy_from_slice(payload),
            })
        );
    }

    udp.send(transport(b"ack")).await;
    assert_eq!(ws.recv().await, Some(transport(b"ack")));

    // A goodbye over UDP tears the session down on the websocket side too.
    udp.send(Message::Close).await;
    assert_eq!(ws.recv().await, Some(Message::Close));
    assert!(ws.closed().await);

    server.close().await.unwrap();
}

#[tokio::test]
async fn unknown_peer_is_reported_without_disconnecting() {
    let mut server = start_server().await;
    let mut z = WsClient::join(ws_addr(&server), "z").await;

    z.send(Message::Bind { target: "w".into() }).await;
    assert_eq!(
        z.recv().await,
        Some(Message::Condition {
            code: ConditionCode::PeerNotFound,
            peer: "w".into(),
        })
    );

    // Still connected: a late arrival can be paired with.
    let _w = WsClient::join(ws_addr(&server), "w").await;
    z.send(Message::Bind { target: "w".into() }).await;
    assert_eq!(z.recv().await, Some(paired("w")));

    server.close().await.unwrap();
}

#[tokio::test]
async fn reconnect_takes_over_identity() {
    let mut server = start_server().await;
    let addr = ws_addr(&server);

    let mut first = WsClient::join(addr, "r").await;
    let mut second = WsClient::join(addr, "r").await;

    assert!(first.closed().await);
    assert_eq!(server.relay().peer_count(), 1);

    // The new holder is the one that gets paired.
    let mut other = WsClient::join(addr, "o").await;
    other.send(Message::Bind { target: "r".into() }).await;
    assert_eq!(second.recv().await, Some(paired("o")));
    assert_eq!(other.recv().await, Some(paired("r")));

    server.close().await.unwrap();
}

#[tokio::test]
async fn silent_connection_is_dropped_after_handshake_timeout() {
    let mut server = start_server().await;
    let mut silent = WsClient::connect(ws_addr(&server)).await;

    let started = std::time::Instant::now();
    assert!(silent.closed().await);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(server.relay().peer_count(), 0);

    server.close().await.unwrap();
}

#[tokio::test]
async fn malformed_hello_closes_connection() {
    let mut server = start_server().await;
    let mut client = WsClient::connect(ws_addr(&server)).await;

    client.send_raw(bytes::Bytes::from_static(b"\x7fgarbage")).await;
    assert!(client.closed().await);

    server.close().await.unwrap();
}
