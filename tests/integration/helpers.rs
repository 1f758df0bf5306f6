//! Shared fixtures for the loopback tests

use std::time::Duration;
use svcnet::{
    ConnectionId, Mailbox, Message, MessageType, Protocol, SocketEvent, TcpManager,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

/// Upper bound for any single wait
pub const WAIT: Duration = Duration::from_secs(5);

/// A manager together with its owner's inbox
pub struct Service {
    pub manager: TcpManager<Mailbox>,
    pub inbox: UnboundedReceiver<Message>,
}

impl Service {
    pub fn new(id: u32, protocol: Protocol) -> Self {
        let (mailbox, inbox) = Mailbox::new(id);
        let mut manager = TcpManager::new(mailbox);
        manager.set_protocol(protocol);
        Self { manager, inbox }
    }

    /// Listen on an ephemeral loopback port and return it
    pub async fn listen(&mut self) -> String {
        assert!(self.manager.listen("127.0.0.1", "0").await);
        self.manager.listen_addr().unwrap().port().to_string()
    }

    /// Drive the manager until its owner receives something
    pub async fn next_message(&mut self) -> Message {
        let Service { manager, inbox } = self;
        timeout(WAIT, async {
            loop {
                if let Ok(msg) = inbox.try_recv() {
                    return msg;
                }
                assert!(manager.dispatch_next().await, "manager destroyed");
            }
        })
        .await
        .expect("timed out waiting for a message")
    }

    /// Next message, asserting it is the given socket event
    pub async fn expect_event(&mut self, event: SocketEvent) -> (ConnectionId, Message) {
        let msg = self.next_message().await;
        assert_eq!(msg.event(), Some(event), "unexpected message: {msg:?}");
        let id = ConnectionId::try_from(msg.sender()).unwrap();
        (id, msg)
    }

    /// Next message, asserting it is a reply to `reply_id`
    pub async fn expect_reply(&mut self, reply_id: i32) -> Message {
        let msg = self.next_message().await;
        assert_eq!(msg.response_id(), reply_id, "unexpected message: {msg:?}");
        msg
    }

    /// Next reply, parsed as a connection id
    pub async fn expect_id_reply(&mut self, reply_id: i32) -> ConnectionId {
        let msg = self.expect_reply(reply_id).await;
        assert_eq!(msg.message_type(), MessageType::Text);
        assert_eq!(msg.header(), "");
        let raw: u16 = msg.text().parse().unwrap();
        ConnectionId::from_raw(raw).unwrap()
    }
}
