//! Reply delivery to the owning service

use tokio::sync::mpsc;
use tracing::trace;

use crate::message::{Message, MessageType, ServiceId};
use crate::metrics::METRICS;

/// The service a manager works for
pub trait Owner {
    /// Identity used as the receiver of every delivered message
    fn id(&self) -> ServiceId;

    /// Inbound message path of the service
    fn handle_message(&mut self, msg: &Message);
}

/// Owner that forwards every message into a channel
#[derive(Debug, Clone)]
pub struct Mailbox {
    id: ServiceId,
    tx: mpsc::UnboundedSender<Message>,
}

impl Mailbox {
    /// Mailbox and the receiving end of its inbox
    pub fn new(id: ServiceId) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }
}

impl Owner for Mailbox {
    fn id(&self) -> ServiceId {
        self.id
    }

    fn handle_message(&mut self, msg: &Message) {
        if self.tx.send(msg.clone()).is_err() {
            trace!(service = self.id, "Inbox closed, message dropped");
        }
    }
}

/// Builds replies in a single reused envelope
#[derive(Debug, Default)]
pub struct ResponseRelay {
    envelope: Message,
}

impl ResponseRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a reply to `owner`; nothing happens for `reply_id == 0`
    pub fn reply<O: Owner + ?Sized>(
        &mut self,
        owner: &mut O,
        data: &[u8],
        header: &str,
        reply_id: i32,
        mtype: MessageType,
    ) -> bool {
        if reply_id == 0 {
            return false;
        }

        let msg = &mut self.envelope;
        msg.set_receiver(owner.id());
        msg.set_sender(0);
        msg.clear();
        msg.write(data);
        msg.set_header(header);
        msg.set_response_id(reply_id);
        msg.set_type(mtype);
        msg.set_event(None);

        METRICS.reply();
        owner.handle_message(msg);
        true
    }
}
