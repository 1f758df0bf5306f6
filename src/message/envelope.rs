//! Message envelope

use bytes::{Bytes, BytesMut};

/// Identity of a service in the owning runtime
pub type ServiceId = u32;

/// Kind of payload carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MessageType {
    #[default]
    Unknown = 0,
    System = 1,
    /// Plain text reply (ids, read results)
    Text = 2,
    /// Raw socket event
    Socket = 4,
    /// Error reply
    Error = 5,
    /// Websocket event
    SocketWs = 6,
}

/// Connection-level event carried by socket messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketEvent {
    /// Dialed connection is open
    Connect,
    /// Accepted connection is open
    Accept,
    /// Inbound data
    Message,
    /// Connection ended on its own
    Close,
}

impl SocketEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketEvent::Connect => "connect",
            SocketEvent::Accept => "accept",
            SocketEvent::Message => "message",
            SocketEvent::Close => "close",
        }
    }
}

/// Envelope passed to the owning service
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    sender: u32,
    receiver: ServiceId,
    header: String,
    response_id: i32,
    mtype: MessageType,
    event: Option<SocketEvent>,
    buffer: BytesMut,
}

impl Message {
    /// Create an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message with the given payload
    pub fn with_payload(mtype: MessageType, data: &[u8]) -> Self {
        let mut msg = Self {
            mtype,
            ..Self::default()
        };
        msg.write(data);
        msg
    }

    /// Sender id; for socket events this is the connection id
    pub fn sender(&self) -> u32 {
        self.sender
    }

    pub fn set_sender(&mut self, sender: u32) {
        self.sender = sender;
    }

    pub fn receiver(&self) -> ServiceId {
        self.receiver
    }

    pub fn set_receiver(&mut self, receiver: ServiceId) {
        self.receiver = receiver;
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn set_header(&mut self, header: &str) {
        self.header.clear();
        self.header.push_str(header);
    }

    /// Correlation token of a reply, 0 for unsolicited messages
    pub fn response_id(&self) -> i32 {
        self.response_id
    }

    pub fn set_response_id(&mut self, response_id: i32) {
        self.response_id = response_id;
    }

    pub fn message_type(&self) -> MessageType {
        self.mtype
    }

    pub fn set_type(&mut self, mtype: MessageType) {
        self.mtype = mtype;
    }

    pub fn event(&self) -> Option<SocketEvent> {
        self.event
    }

    pub fn set_event(&mut self, event: Option<SocketEvent>) {
        self.event = event;
    }

    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Payload as UTF-8, lossy
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.buffer)
    }

    /// Payload length
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Append to the payload
    pub fn write(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Drop the payload, keeping its allocation
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Copy of the payload as shareable bytes
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer)
    }
}
