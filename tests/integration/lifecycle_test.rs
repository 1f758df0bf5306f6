//! Close, timeout and teardown behaviour

use super::helpers::{Service, WAIT};
use std::time::Duration;
use svcnet::{MessageType, Protocol, ReadMode, SocketEvent};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::test]
async fn test_close_then_send_fails() {
    let mut server = Service::new(1, Protocol::Socket);
    let mut client = Service::new(2, Protocol::Socket);
    let port = server.listen().await;

    let cid = client.manager.connect("127.0.0.1", &port).await.unwrap();
    assert!(client.manager.close(cid));
    assert!(!client.manager.send(cid, "late"));
    assert!(!client.manager.close(cid));

    // the peer sees the connection end
    server.expect_event(SocketEvent::Accept).await;
    let (_, msg) = server.expect_event(SocketEvent::Close).await;
    assert_eq!(msg.text(), "eof");

    // a user close raises no close event locally
    client.expect_event(SocketEvent::Connect).await;
    assert!(client.inbox.try_recv().is_err());
}

#[tokio::test]
async fn test_close_answers_pending_read() {
    let mut server = Service::new(1, Protocol::Text);
    let mut client = Service::new(2, Protocol::Text);
    let port = server.listen().await;

    server.manager.async_accept(1);
    let _cid = client.manager.connect("127.0.0.1", &port).await.unwrap();
    let sid = server.expect_id_reply(1).await;

    server.manager.read(sid, 8, ReadMode::Exact, 2);
    // a second read while one is pending is dropped without a reply
    server.manager.read(sid, 8, ReadMode::Exact, 3);
    assert!(server.manager.close(sid));

    let msg = server.expect_reply(2).await;
    assert_eq!(msg.header(), "closed");
    assert_eq!(msg.message_type(), MessageType::Error);
    assert_eq!(server.manager.run_pending(), 0);
    assert!(server.inbox.try_recv().is_err());
}

#[tokio::test]
async fn test_destroy_twice() {
    let mut server = Service::new(1, Protocol::Socket);
    let mut client = Service::new(2, Protocol::Socket);
    let port = server.listen().await;

    client.manager.connect("127.0.0.1", &port).await.unwrap();
    server.expect_event(SocketEvent::Accept).await;

    assert_eq!(server.manager.destroy(), 1);
    assert_eq!(server.manager.destroy(), 0);
    assert_eq!(server.manager.connection_count(), 0);
    assert!(server.manager.listen_addr().is_none());
    assert!(!server.manager.dispatch_next().await);
}

#[tokio::test]
async fn test_listen_on_taken_port_fails() {
    let mut first = Service::new(1, Protocol::Socket);
    let port = first.listen().await;

    let mut second = Service::new(2, Protocol::Socket);
    assert!(!second.manager.listen("127.0.0.1", &port).await);
    assert!(second.manager.listen_addr().is_none());

    // a failed relisten keeps the current listener
    let own = second.listen().await;
    assert!(!second.manager.listen("127.0.0.1", &port).await);
    assert_eq!(second.manager.listen_addr().unwrap().port().to_string(), own);
}

#[tokio::test]
async fn test_replaced_listener_is_closed() {
    let mut server = Service::new(1, Protocol::Socket);
    let old = server.listen().await;
    let new = server.listen().await;
    assert_ne!(old, new);

    assert!(TcpStream::connect(format!("127.0.0.1:{old}")).await.is_err());
    let _first = TcpStream::connect(format!("127.0.0.1:{new}")).await.unwrap();
    server.expect_event(SocketEvent::Accept).await;

    // the port already held can be listened on again
    assert!(server.manager.listen("127.0.0.1", &new).await);
    assert_eq!(server.manager.listen_addr().unwrap().port().to_string(), new);
    let _second = TcpStream::connect(format!("127.0.0.1:{new}")).await.unwrap();
    server.expect_event(SocketEvent::Accept).await;
    assert_eq!(server.manager.connection_count(), 2);
}

#[tokio::test]
async fn test_listen_with_bad_port_fails() {
    let mut service = Service::new(1, Protocol::Socket);
    assert!(!service.manager.listen("127.0.0.1", "port").await);
    assert!(!service.manager.listen("127.0.0.1", "65536").await);
    assert!(service.manager.listen_addr().is_none());
}

#[tokio::test]
async fn test_idle_connection_times_out() {
    let mut server = Service::new(1, Protocol::Socket);
    server.manager.set_sweep_period(Duration::from_millis(100));
    server.manager.set_timeout(1);
    assert_eq!(server.manager.idle_timeout(), 1);
    let port = server.listen().await;

    let mut peer = TcpStream::connect(format!("127.0.0.1:{port}")).await.unwrap();
    let (sid, _) = server.expect_event(SocketEvent::Accept).await;

    let (id, msg) = server.expect_event(SocketEvent::Close).await;
    assert_eq!(id, sid);
    assert_eq!(msg.text(), "read timeout");
    assert!(!server.manager.contains(sid));

    // the peer sees the socket go away
    let mut buf = [0u8; 1];
    let read = timeout(WAIT, peer.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_zero_timeout_keeps_connections() {
    let mut server = Service::new(1, Protocol::Socket);
    server.manager.set_sweep_period(Duration::from_millis(50));
    server.manager.set_timeout(0);
    let port = server.listen().await;

    let _peer = TcpStream::connect(format!("127.0.0.1:{port}")).await.unwrap();
    let (sid, _) = server.expect_event(SocketEvent::Accept).await;

    // let a few sweeps run
    let _ = timeout(Duration::from_millis(300), async {
        loop {
            server.manager.dispatch_next().await;
        }
    })
    .await;
    assert!(server.manager.contains(sid));
}

#[tokio::test]
async fn test_send_then_close() {
    let mut server = Service::new(1, Protocol::Socket);
    let mut client = Service::new(2, Protocol::Socket);
    let port = server.listen().await;

    let cid = client.manager.connect("127.0.0.1", &port).await.unwrap();
    client.expect_event(SocketEvent::Connect).await;
    let (sid, _) = server.expect_event(SocketEvent::Accept).await;

    assert!(server.manager.send_then_close(sid, "bye"));
    assert!(!server.manager.send(sid, "more"));

    let (_, msg) = client.expect_event(SocketEvent::Message).await;
    assert_eq!(msg.text(), "bye");
    let (id, _) = client.expect_event(SocketEvent::Close).await;
    assert_eq!(id, cid);

    let (id, msg) = server.expect_event(SocketEvent::Close).await;
    assert_eq!(id, sid);
    assert_eq!(msg.text(), "shutdown");
    assert_eq!(server.manager.connection_count(), 0);
}
