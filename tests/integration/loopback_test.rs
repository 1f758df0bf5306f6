//! Data paths over loopback: text reads, raw and framed sockets

use super::helpers::{Service, WAIT};
use svcnet::{MessageType, Protocol, ReadMode, SocketEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::test]
async fn test_text_accept_and_exact_read() {
    let mut server = Service::new(1, Protocol::Text);
    let mut client = Service::new(2, Protocol::Text);
    let port = server.listen().await;

    server.manager.async_accept(10);
    let cid = client.manager.connect("127.0.0.1", &port).await.unwrap();
    let sid = server.expect_id_reply(10).await;
    assert_eq!(server.manager.connection_count(), 1);

    assert!(client.manager.send(cid, "hello world"));
    server.manager.read(sid, 5, ReadMode::Exact, 11);
    let msg = server.expect_reply(11).await;
    assert_eq!(msg.message_type(), MessageType::Text);
    assert_eq!(msg.text(), "hello");

    // remaining bytes stay buffered for the next request
    server.manager.read(sid, 0, ReadMode::Exact, 12);
    assert_eq!(server.expect_reply(12).await.text(), " world");
}

#[tokio::test]
async fn test_text_line_reads() {
    let mut server = Service::new(1, Protocol::Text);
    let mut client = Service::new(2, Protocol::Text);
    let port = server.listen().await;

    server.manager.async_accept(1);
    let cid = client.manager.connect("127.0.0.1", &port).await.unwrap();
    let sid = server.expect_id_reply(1).await;

    assert!(client.manager.send(cid, "GET / HTTP/1.1\r\nping\n"));
    server.manager.read(sid, 0, ReadMode::Crlf, 2);
    assert_eq!(server.expect_reply(2).await.text(), "GET / HTTP/1.1");
    server.manager.read(sid, 0, ReadMode::Lf, 3);
    assert_eq!(server.expect_reply(3).await.text(), "ping");
}

#[tokio::test]
async fn test_text_read_fails_when_peer_leaves() {
    let mut server = Service::new(1, Protocol::Text);
    let mut client = Service::new(2, Protocol::Text);
    let port = server.listen().await;

    server.manager.async_accept(1);
    let cid = client.manager.connect("127.0.0.1", &port).await.unwrap();
    let sid = server.expect_id_reply(1).await;

    server.manager.read(sid, 4, ReadMode::Exact, 5);
    assert!(client.manager.close(cid));

    let msg = server.expect_reply(5).await;
    assert_eq!(msg.message_type(), MessageType::Error);
    assert_eq!(msg.header(), "closed");
    assert!(!server.manager.contains(sid));
}

#[tokio::test]
async fn test_async_connect_replies_with_id() {
    let mut server = Service::new(1, Protocol::Text);
    let mut client = Service::new(2, Protocol::Text);
    let port = server.listen().await;

    server.manager.async_accept(1);
    client.manager.async_connect("127.0.0.1", &port, 7);
    let cid = client.expect_id_reply(7).await;
    let sid = server.expect_id_reply(1).await;

    assert!(client.manager.contains(cid));
    assert!(server.manager.contains(sid));
    let info = client.manager.connection_info(cid).unwrap();
    assert_eq!(info.peer, format!("127.0.0.1:{port}"));
}

#[tokio::test]
async fn test_async_connect_failure_reply() {
    let mut client = Service::new(2, Protocol::Socket);
    client.manager.async_connect("127.0.0.1", "not-a-port", 4);

    let msg = client.expect_reply(4).await;
    assert_eq!(msg.message_type(), MessageType::Error);
    assert!(msg.data().is_empty());
    assert!(msg.header().starts_with("error async_connect "));
}

#[tokio::test]
async fn test_connect_refused_returns_none() {
    // grab a free port, then release it so nothing is listening
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port().to_string();
    drop(probe);

    let mut client = Service::new(2, Protocol::Socket);
    assert!(client.manager.connect("127.0.0.1", &port).await.is_none());
    assert_eq!(client.manager.connection_count(), 0);
}

#[tokio::test]
async fn test_socket_echo_with_events() {
    let mut server = Service::new(1, Protocol::Socket);
    let mut client = Service::new(2, Protocol::Socket);
    let port = server.listen().await;

    let cid = client.manager.connect("127.0.0.1", &port).await.unwrap();
    let (connect_id, connect) = client.expect_event(SocketEvent::Connect).await;
    assert_eq!(connect_id, cid);
    assert_eq!(connect.message_type(), MessageType::Socket);
    assert_eq!(connect.receiver(), 2);

    let (sid, _) = server.expect_event(SocketEvent::Accept).await;
    assert!(client.manager.send(cid, "ping"));

    let (from, msg) = server.expect_event(SocketEvent::Message).await;
    assert_eq!(from, sid);
    assert_eq!(msg.text(), "ping");
    assert!(server.manager.send_message(sid, &msg));

    let (_, echoed) = client.expect_event(SocketEvent::Message).await;
    assert_eq!(echoed.text(), "ping");
}

#[tokio::test]
async fn test_accept_loop_rearms() {
    let mut server = Service::new(1, Protocol::Socket);
    let port = server.listen().await;

    let mut clients = Vec::new();
    for n in 0..3 {
        let mut client = Service::new(10 + n, Protocol::Socket);
        client.manager.connect("127.0.0.1", &port).await.unwrap();
        clients.push(client);
        server.expect_event(SocketEvent::Accept).await;
    }

    let ids: Vec<u16> = server
        .manager
        .list_connections()
        .iter()
        .map(|info| info.id.as_u16())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_framed_socket_round_trip() {
    let mut server = Service::new(1, Protocol::Socket);
    let mut client = Service::new(2, Protocol::Socket);
    server.manager.set_enable_frame("rw");
    client.manager.set_enable_frame("wr");
    let port = server.listen().await;

    let cid = client.manager.connect("127.0.0.1", &port).await.unwrap();
    let (sid, _) = server.expect_event(SocketEvent::Accept).await;

    assert!(client.manager.send(cid, "abc"));
    assert!(client.manager.send(cid, "defg"));
    assert_eq!(server.expect_event(SocketEvent::Message).await.1.text(), "abc");
    assert_eq!(server.expect_event(SocketEvent::Message).await.1.text(), "defg");

    let too_big = vec![0u8; 0x1_0000];
    assert!(!server.manager.send(sid, too_big));
    assert!(server.manager.send(sid, vec![1u8; 0xFFFF]));
}

#[tokio::test]
async fn test_framed_receive_from_raw_peer() {
    let mut server = Service::new(1, Protocol::Socket);
    server.manager.set_enable_frame("r");
    let port = server.listen().await;

    let mut peer = TcpStream::connect(format!("127.0.0.1:{port}")).await.unwrap();
    let (sid, _) = server.expect_event(SocketEvent::Accept).await;

    peer.write_all(&[0, 2, b'h', b'i', 0, 1]).await.unwrap();
    assert_eq!(server.expect_event(SocketEvent::Message).await.1.text(), "hi");
    peer.write_all(b"!").await.unwrap();
    assert_eq!(server.expect_event(SocketEvent::Message).await.1.text(), "!");

    // send side is unframed in receive-only mode
    assert!(server.manager.send(sid, "ok"));
    let mut buf = [0u8; 2];
    timeout(WAIT, peer.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ok");
}
