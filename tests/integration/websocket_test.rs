//! Websocket handshake and framing over loopback

use super::helpers::{Service, WAIT};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use svcnet::codec::ws::{self, Role, WsCodec, WsItem};
use svcnet::{MessageType, Protocol, SocketEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use std::time::Duration;
use tokio::time::{interval, timeout, Instant};
use tokio_util::codec::Framed;

#[tokio::test]
async fn test_websocket_echo_between_managers() {
    let mut server = Service::new(1, Protocol::WebSocket);
    let mut client = Service::new(2, Protocol::WebSocket);
    let port = server.listen().await;

    let cid = client.manager.connect("127.0.0.1", &port).await.unwrap();
    // nothing goes out before the handshake completes
    assert!(!client.manager.send(cid, "early"));

    let (id, connect) = client.expect_event(SocketEvent::Connect).await;
    assert_eq!(id, cid);
    assert_eq!(connect.message_type(), MessageType::SocketWs);
    let (sid, _) = server.expect_event(SocketEvent::Accept).await;

    assert!(client.manager.send(cid, "hi there"));
    let (_, msg) = server.expect_event(SocketEvent::Message).await;
    assert_eq!(msg.text(), "hi there");
    assert_eq!(msg.message_type(), MessageType::SocketWs);

    assert!(server.manager.send_message(sid, &msg));
    assert_eq!(client.expect_event(SocketEvent::Message).await.1.text(), "hi there");

    // graceful close sends a close frame; the peer answers and leaves
    assert!(server.manager.close(sid));
    let (id, _) = client.expect_event(SocketEvent::Close).await;
    assert_eq!(id, cid);
}

#[tokio::test]
async fn test_raw_websocket_client() {
    let mut server = Service::new(1, Protocol::WebSocket);
    let port = server.listen().await;
    let host = format!("127.0.0.1:{port}");

    let mut stream = TcpStream::connect(&host).await.unwrap();
    let key = ws::client_key().unwrap();
    stream.write_all(&ws::client_request(&host, &key)).await.unwrap();

    let mut peer = Framed::new(stream, WsCodec::new(Role::Client));
    let head = match timeout(WAIT, peer.next()).await.unwrap() {
        Some(Ok(WsItem::Head(head))) => head,
        other => panic!("expected handshake response, got {other:?}"),
    };
    ws::verify_server_response(&head, &key).unwrap();
    peer.codec_mut().open();

    let (sid, _) = server.expect_event(SocketEvent::Accept).await;

    peer.send(WsItem::Ping(Bytes::from_static(b"are you there"))).await.unwrap();
    match timeout(WAIT, peer.next()).await.unwrap() {
        Some(Ok(WsItem::Pong(payload))) => assert_eq!(&payload[..], b"are you there"),
        other => panic!("expected pong, got {other:?}"),
    }

    peer.send(WsItem::Binary(Bytes::from_static(b"\x00\x01binary"))).await.unwrap();
    let (from, msg) = server.expect_event(SocketEvent::Message).await;
    assert_eq!(from, sid);
    assert_eq!(msg.data(), b"\x00\x01binary");

    assert!(server.manager.send(sid, "reply"));
    match timeout(WAIT, peer.next()).await.unwrap() {
        Some(Ok(WsItem::Binary(payload))) => assert_eq!(&payload[..], b"reply"),
        other => panic!("expected binary frame, got {other:?}"),
    }

    // close handshake: server echoes the code, then retires the connection
    peer.send(WsItem::Close(Some(1000))).await.unwrap();
    match timeout(WAIT, peer.next()).await.unwrap() {
        Some(Ok(WsItem::Close(code))) => assert_eq!(code, Some(1000)),
        other => panic!("expected close frame, got {other:?}"),
    }
    let (id, _) = server.expect_event(SocketEvent::Close).await;
    assert_eq!(id, sid);
}

#[tokio::test]
async fn test_pings_keep_idle_connection_alive() {
    let mut server = Service::new(1, Protocol::WebSocket);
    server.manager.set_sweep_period(Duration::from_millis(100));
    server.manager.set_timeout(1);
    let port = server.listen().await;
    let host = format!("127.0.0.1:{port}");

    let mut stream = TcpStream::connect(&host).await.unwrap();
    let key = ws::client_key().unwrap();
    stream.write_all(&ws::client_request(&host, &key)).await.unwrap();
    let mut peer = Framed::new(stream, WsCodec::new(Role::Client));
    match timeout(WAIT, peer.next()).await.unwrap() {
        Some(Ok(WsItem::Head(head))) => ws::verify_server_response(&head, &key).unwrap(),
        other => panic!("expected handshake response, got {other:?}"),
    }
    peer.codec_mut().open();
    let (sid, _) = server.expect_event(SocketEvent::Accept).await;

    // only control frames for well past the timeout
    let deadline = Instant::now() + Duration::from_millis(2500);
    let mut heartbeat = interval(Duration::from_millis(250));
    while Instant::now() < deadline {
        tokio::select! {
            _ = heartbeat.tick() => {
                peer.send(WsItem::Ping(Bytes::from_static(b"hb"))).await.unwrap();
            }
            alive = server.manager.dispatch_next() => assert!(alive),
        }
    }

    assert!(server.manager.contains(sid));
    assert!(server.inbox.try_recv().is_err());
}

#[tokio::test]
async fn test_plain_http_request_rejected() {
    let mut server = Service::new(1, Protocol::WebSocket);
    let port = server.listen().await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{port}")).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut response)).await.unwrap().unwrap();
    assert!(response.starts_with(b"HTTP/1.1 400"));

    // the connection never opened, so only the close is reported
    let (_, msg) = server.expect_event(SocketEvent::Close).await;
    assert!(msg.text().contains("handshake"));
    assert_eq!(server.manager.connection_count(), 0);
}
