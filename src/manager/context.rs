//! Completion queue and liveness flag shared with spawned tasks

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::connection::ConnectionId;
use crate::error::NetError;
use crate::message::MessageType;

/// Work handed back to the manager's execution context
#[derive(Debug)]
pub(crate) enum Completion {
    Accepted {
        stream: TcpStream,
        peer: SocketAddr,
        // listener generation the accept was issued on
        epoch: u64,
        reply_id: i32,
    },
    AcceptFailed {
        error: NetError,
        epoch: u64,
        reply_id: i32,
    },
    Connected {
        stream: TcpStream,
        peer: SocketAddr,
        reply_id: i32,
    },
    ConnectFailed {
        error: NetError,
        reply_id: i32,
    },
    /// Deferred reply built outside a dispatch
    Reply {
        data: Bytes,
        header: String,
        reply_id: i32,
        mtype: MessageType,
    },
    Socket {
        id: ConnectionId,
        serial: u64,
        event: ConnEvent,
    },
    SweepTick,
}

/// Event raised by a connection's reader or writer task
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// Websocket handshake finished
    Opened,
    Data(Bytes),
    /// Inbound traffic the owner never sees, such as websocket pings
    Activity,
    ReadDone { reply_id: i32, data: Bytes },
    ReadFailed { reply_id: i32, error: NetError },
    Closed(CloseReason),
}

/// Why a connection ended on its own
#[derive(Debug)]
pub enum CloseReason {
    /// Peer closed its side
    Eof,
    /// A `send_then_close` payload was flushed
    Shutdown,
    /// Idle longer than the configured timeout
    Timeout,
    Error(NetError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof => f.write_str("eof"),
            CloseReason::Shutdown => f.write_str("shutdown"),
            CloseReason::Timeout => write!(f, "{}", NetError::Timeout),
            CloseReason::Error(e) => write!(f, "{e}"),
        }
    }
}

/// Handle given to every spawned task
#[derive(Debug, Clone)]
pub(crate) struct Context {
    tx: mpsc::UnboundedSender<Completion>,
    shutdown: watch::Receiver<bool>,
}

impl Context {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Completion>, shutdown: watch::Receiver<bool>) -> Self {
        Self { tx, shutdown }
    }

    /// Queue a completion; false once the manager is gone
    pub(crate) fn post(&self, completion: Completion) -> bool {
        self.is_live() && self.tx.send(completion).is_ok()
    }

    pub(crate) fn is_live(&self) -> bool {
        !*self.shutdown.borrow()
    }

    /// Resolves when the manager is torn down or dropped
    pub(crate) async fn cancelled(&self) {
        let mut shutdown = self.shutdown.clone();
        let _ = shutdown.wait_for(|down| *down).await;
    }
}
