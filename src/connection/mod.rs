//! Connection management
//!
//! A [`Connection`] owns one socket. Its reader and writer run as tokio
//! tasks and report back through the manager's completion queue; every
//! field here is only touched from the manager's context.

mod socket;
mod state;
mod table;
mod text;
mod websocket;

pub use state::{ConnectionId, ConnectionInfo, ConnectionPhase, ConnectionState, Direction};
pub use table::{ConnectionTable, IdAllocator, MAX_ID};

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::codec::ws::{self, OpCode, Role};
use crate::codec::{frame, FrameMode, ReadRequest};
use crate::config::Protocol;
use crate::manager::{CloseReason, Completion, ConnEvent, Context};
use crate::metrics::METRICS;

/// Work for a connection's writer task
#[derive(Debug)]
pub(crate) enum WriterCommand {
    /// Write bytes as-is; with a reason the socket is shut down afterwards
    Write {
        data: Bytes,
        close_after: Option<CloseReason>,
    },
    NoDelay,
    /// Flush what is queued, then shut down the write side
    Shutdown,
}

/// Posts events tagged with the connection's id and serial
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    ctx: Context,
    id: ConnectionId,
    serial: u64,
}

impl EventSink {
    fn emit(&self, event: ConnEvent) {
        self.ctx.post(Completion::Socket {
            id: self.id,
            serial: self.serial,
            event,
        });
    }
}

/// One live socket
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    serial: u64,
    protocol: Protocol,
    direction: Direction,
    frame: FrameMode,
    state: ConnectionState,
    stream: Option<TcpStream>,
    writer: Option<mpsc::UnboundedSender<WriterCommand>>,
    reads: Option<mpsc::UnboundedSender<ReadRequest>>,
    pending_read: Option<i32>,
    writer_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        serial: u64,
        protocol: Protocol,
        frame: FrameMode,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Self {
        Self {
            id,
            serial,
            protocol,
            direction: Direction::Accepted,
            frame,
            state: ConnectionState::new(peer),
            stream: Some(stream),
            writer: None,
            reads: None,
            pending_read: None,
            writer_task: None,
            reader_task: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Only meaningful before [`start`](Self::start); running tasks keep the old id
    pub fn set_id(&mut self, id: ConnectionId) {
        self.id = id;
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn peer(&self) -> SocketAddr {
        self.state.peer
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo::new(self.id, self.direction, &self.state)
    }

    fn ws_role(&self) -> Role {
        match self.direction {
            Direction::Accepted => Role::Server,
            Direction::Dialed => Role::Client,
        }
    }

    /// Spawn the reader and writer tasks
    pub(crate) fn start(&mut self, direction: Direction, ctx: Context) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        self.direction = direction;

        let events = EventSink {
            ctx,
            id: self.id,
            serial: self.serial,
        };
        let (reader, writer) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        self.writer_task = Some(tokio::spawn(write_loop(writer, writer_rx, events.clone())));
        let reader_task = match self.protocol {
            Protocol::Socket => {
                self.state.set_active();
                tokio::spawn(socket::read_loop(reader, self.frame, events))
            }
            Protocol::Text => {
                let (reads_tx, reads_rx) = mpsc::unbounded_channel();
                self.reads = Some(reads_tx);
                self.state.set_active();
                tokio::spawn(text::read_loop(reader, reads_rx, events))
            }
            Protocol::WebSocket => tokio::spawn(websocket::run(
                reader,
                writer_tx.clone(),
                self.ws_role(),
                self.state.peer,
                events,
            )),
        };
        self.reader_task = Some(reader_task);
        self.writer = Some(writer_tx);
    }

    /// Websocket handshake completed
    pub(crate) fn mark_open(&mut self) {
        if self.state.phase == ConnectionPhase::Connecting {
            self.state.set_active();
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.phase == ConnectionPhase::Active
    }

    /// Queue a read request; only the text variant reads on demand, one at a time
    pub fn read(&mut self, request: ReadRequest) -> bool {
        if self.pending_read.is_some() || self.state.is_closing() {
            return false;
        }
        let Some(reads) = &self.reads else {
            return false;
        };
        if reads.send(request).is_err() {
            return false;
        }
        self.pending_read = Some(request.reply_id);
        true
    }

    /// The pending read, if any, is no longer outstanding
    pub(crate) fn finish_read(&mut self) -> Option<i32> {
        self.pending_read.take()
    }

    /// Queue a payload; `close_after` shuts the socket down once it is flushed
    pub fn send(&mut self, data: Bytes, close_after: bool) -> bool {
        if data.is_empty() || self.state.is_closing() {
            return false;
        }

        let payload = match self.protocol {
            Protocol::Socket => match frame::encode(self.frame, data) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(conn_id = %self.id, error = %e, "Send rejected");
                    return false;
                }
            },
            Protocol::Text => data,
            Protocol::WebSocket => {
                if !self.is_open() {
                    return false;
                }
                let mut buf = BytesMut::new();
                if let Err(e) = ws::encode_frame(self.ws_role(), OpCode::Binary, &data, &mut buf) {
                    debug!(conn_id = %self.id, error = %e, "Send rejected");
                    return false;
                }
                buf.freeze()
            }
        };

        let len = payload.len() as u64;
        let command = WriterCommand::Write {
            data: payload,
            close_after: close_after.then_some(CloseReason::Shutdown),
        };
        if !self.command(command) {
            return false;
        }

        self.state.record_tx(len);
        if close_after {
            self.state.set_draining();
        }
        true
    }

    pub fn set_no_delay(&mut self) {
        self.command(WriterCommand::NoDelay);
    }

    /// Change send framing for this connection; receive framing is fixed at start
    pub fn set_enable_frame(&mut self, mode: FrameMode) {
        self.frame = mode;
    }

    pub fn frame_mode(&self) -> FrameMode {
        self.frame
    }

    /// True when nothing arrived for longer than `secs`; 0 disables the check
    pub fn timeout_check(&self, now: Instant, secs: u32) -> bool {
        secs != 0 && self.state.idle_at(now) > Duration::from_secs(u64::from(secs))
    }

    /// Stop the connection
    ///
    /// A forced close aborts both tasks. Otherwise queued writes are flushed
    /// (websockets get a close frame first) and the write side is shut down.
    pub fn close(&mut self, force: bool) {
        if self.state.phase == ConnectionPhase::Closed {
            return;
        }

        if let Some(reader) = self.reader_task.take() {
            reader.abort();
        }
        self.reads = None;

        if force {
            if let Some(writer) = self.writer_task.take() {
                writer.abort();
            }
            self.writer = None;
        } else {
            if self.protocol == Protocol::WebSocket && self.is_open() {
                let mut buf = BytesMut::new();
                if ws::encode_frame(self.ws_role(), OpCode::Close, &1000u16.to_be_bytes(), &mut buf).is_ok() {
                    self.command(WriterCommand::Write {
                        data: buf.freeze(),
                        close_after: None,
                    });
                }
            }
            self.command(WriterCommand::Shutdown);
            // the writer finishes on its own
            self.writer_task = None;
            self.writer = None;
        }

        self.stream = None;
        self.state.set_closed();
    }

    fn command(&self, command: WriterCommand) -> bool {
        match &self.writer {
            Some(writer) => writer.send(command).is_ok(),
            None => false,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close(true);
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    events: EventSink,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Write { data, close_after } => {
                if let Err(e) = writer.write_all(&data).await {
                    events.emit(ConnEvent::Closed(CloseReason::Error(e.into())));
                    return;
                }
                METRICS.bytes_tx(data.len() as u64);

                if let Some(reason) = close_after {
                    let _ = writer.shutdown().await;
                    events.emit(ConnEvent::Closed(reason));
                    return;
                }
            }
            WriterCommand::NoDelay => {
                if let Err(e) = writer.as_ref().set_nodelay(true) {
                    debug!(conn_id = %events.id, error = %e, "Failed to set TCP_NODELAY");
                }
            }
            WriterCommand::Shutdown => {
                let _ = writer.shutdown().await;
                trace!(conn_id = %events.id, "Write side shut down");
                return;
            }
        }
    }
}
