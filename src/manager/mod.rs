//! Per-service TCP connection manager
//!
//! [`TcpManager`] owns the listener, the connection table and the reply
//! envelope of one service. Spawned tasks never touch that state: they post
//! completions to a queue which the owning service drains through
//! [`TcpManager::dispatch_next`] or [`TcpManager::run_pending`].

mod context;
mod relay;
mod sweeper;

pub use context::CloseReason;
pub use relay::{Mailbox, Owner, ResponseRelay};

pub(crate) use context::{Completion, ConnEvent, Context};

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{FrameMode, ReadMode, ReadRequest};
use crate::config::{Protocol, TcpConfig};
use crate::connection::{Connection, ConnectionId, ConnectionInfo, ConnectionTable, Direction};
use crate::error::{describe, NetError};
use crate::message::{Message, MessageType, SocketEvent};
use crate::metrics::METRICS;
use crate::server::{self, Listener};
use crate::util::tune_stream;

/// Default interval between idle sweeps
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(10);

/// Connection manager of one service
pub struct TcpManager<O: Owner> {
    owner: O,
    relay: ResponseRelay,
    protocol: Protocol,
    frame_mode: FrameMode,
    no_delay: bool,
    idle_timeout_secs: u32,
    sweep_period: Duration,
    sweeper: Option<JoinHandle<()>>,
    // a sweep tick is queued and not yet handled
    sweep_pending: Arc<AtomicBool>,
    table: ConnectionTable,
    listener: Option<Listener>,
    listener_epoch: u64,
    next_serial: u64,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    shutdown: watch::Sender<bool>,
}

impl<O: Owner> TcpManager<O> {
    /// Manager with the socket protocol, no framing and no idle timeout
    pub fn new(owner: O) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        Self {
            owner,
            relay: ResponseRelay::new(),
            protocol: Protocol::default(),
            frame_mode: FrameMode::default(),
            no_delay: false,
            idle_timeout_secs: 0,
            sweep_period: DEFAULT_SWEEP_PERIOD,
            sweeper: None,
            sweep_pending: Arc::new(AtomicBool::new(false)),
            table: ConnectionTable::new(),
            listener: None,
            listener_epoch: 0,
            next_serial: 0,
            completions_tx,
            completions_rx,
            shutdown,
        }
    }

    /// Manager configured from a `[tcp]` section
    ///
    /// Arms the idle sweeper when a timeout is configured, which needs a
    /// running tokio runtime.
    pub fn with_config(owner: O, config: &TcpConfig) -> Self {
        let mut manager = Self::new(owner);
        manager.protocol = config.protocol;
        manager.frame_mode = config.frame;
        manager.no_delay = config.no_delay;
        manager.sweep_period = config.sweep_period();
        if let Some(secs) = config.idle_timeout_secs {
            manager.set_timeout(secs);
        }
        manager
    }

    pub fn owner(&self) -> &O {
        &self.owner
    }

    pub fn owner_mut(&mut self) -> &mut O {
        &mut self.owner
    }

    fn is_alive(&self) -> bool {
        !*self.shutdown.borrow()
    }

    fn context(&self) -> Context {
        Context::new(self.completions_tx.clone(), self.shutdown.subscribe())
    }

    fn post(&self, completion: Completion) {
        let _ = self.completions_tx.send(completion);
    }

    // Acceptor / dialer

    /// Bind a listener on `host:port`
    ///
    /// A successful bind closes the previous listener before the new one
    /// takes over. On failure the previous listener is kept, unless it held
    /// the requested port and had to be released for the bind. For the
    /// socket and websocket protocols an accept loop starts right away.
    pub async fn listen(&mut self, host: &str, port: &str) -> bool {
        if !self.is_alive() {
            return false;
        }

        // the port we hold can only be bound again once it is released
        if self.holds_port(port) {
            self.close_listener().await;
        }

        match server::bind(host, port).await {
            Ok((socket, addr)) => {
                self.close_listener().await;
                info!(%addr, protocol = ?self.protocol, "Listening");
                self.listener_epoch += 1;
                self.listener = Some(Listener::new(socket, addr, self.listener_epoch));

                if matches!(self.protocol, Protocol::Socket | Protocol::WebSocket) {
                    self.async_accept(0);
                }
                true
            }
            Err(e) => {
                error!("{}:{} {}", host, port, e);
                false
            }
        }
    }

    fn holds_port(&self, port: &str) -> bool {
        match (self.listen_addr(), port.parse::<u16>()) {
            (Some(addr), Ok(port)) => port != 0 && addr.port() == port,
            _ => false,
        }
    }

    async fn close_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.close().await;
        }
    }

    /// Accept one connection in the background
    ///
    /// With `reply_id == 0` the accept re-arms itself after every success;
    /// otherwise the new connection id is replied and nothing is re-armed.
    pub fn async_accept(&mut self, reply_id: i32) {
        if !self.is_alive() {
            return;
        }

        let ctx = self.context();
        let Some(listener) = self.listener.as_mut() else {
            warn!(reply_id, "tcp async_accept without an open listener");
            if reply_id != 0 {
                METRICS.connection_failed();
                let error: NetError =
                    io::Error::new(io::ErrorKind::NotConnected, "listener is not open").into();
                self.post(Completion::Reply {
                    data: Bytes::from(describe("tcp async_accept error", &error)),
                    header: "error".to_string(),
                    reply_id,
                    mtype: MessageType::Error,
                });
            }
            return;
        };

        listener.accept(ctx, reply_id);
    }

    /// Connect and wait for the result
    ///
    /// Holds the manager for the whole attempt; returns `None` on failure.
    pub async fn connect(&mut self, host: &str, port: &str) -> Option<ConnectionId> {
        if !self.is_alive() {
            return None;
        }

        match server::connect(host, port).await {
            Ok((stream, peer)) => Some(self.adopt(stream, peer, Direction::Dialed)),
            Err(e) => {
                METRICS.connection_failed();
                warn!("{}:{} {}", host, port, e);
                None
            }
        }
    }

    /// Connect in the background and reply with the connection id
    pub fn async_connect(&mut self, host: &str, port: &str, reply_id: i32) {
        if !self.is_alive() {
            return;
        }
        server::connect_in_background(host.to_string(), port.to_string(), self.context(), reply_id);
    }

    // Connection table operations

    /// Request one read from a text connection; the result arrives as a reply
    pub fn read(&mut self, id: ConnectionId, size: usize, mode: ReadMode, reply_id: i32) {
        let Some(conn) = self.table.get_mut(id) else {
            self.post(Completion::Reply {
                data: Bytes::from(NetError::InvalidSocket.to_string()),
                header: "closed".to_string(),
                reply_id,
                mtype: MessageType::Error,
            });
            return;
        };

        let request = ReadRequest {
            mode,
            size,
            reply_id,
        };
        if !conn.read(request) {
            debug!(conn_id = %id, reply_id, "Read request rejected");
        }
    }

    pub fn send(&mut self, id: ConnectionId, data: impl Into<Bytes>) -> bool {
        match self.table.get_mut(id) {
            Some(conn) => conn.send(data.into(), false),
            None => false,
        }
    }

    /// Send, then close the connection once the payload is flushed
    pub fn send_then_close(&mut self, id: ConnectionId, data: impl Into<Bytes>) -> bool {
        match self.table.get_mut(id) {
            Some(conn) => conn.send(data.into(), true),
            None => false,
        }
    }

    /// Send the payload of a message
    pub fn send_message(&mut self, id: ConnectionId, msg: &Message) -> bool {
        self.send(id, msg.to_bytes())
    }

    /// Remove and gracefully close a connection; false if it did not exist
    pub fn close(&mut self, id: ConnectionId) -> bool {
        let Some(mut conn) = self.table.remove(id) else {
            return false;
        };

        conn.close(false);
        METRICS.connection_closed();
        debug!(conn_id = %id, peer = %conn.peer(), "Connection closed");

        if let Some(reply_id) = conn.finish_read() {
            self.post(Completion::Reply {
                data: Bytes::from_static(b"closed"),
                header: "closed".to_string(),
                reply_id,
                mtype: MessageType::Error,
            });
        }
        true
    }

    pub fn set_no_delay(&mut self, id: ConnectionId) {
        if let Some(conn) = self.table.get_mut(id) {
            conn.set_no_delay();
        }
    }

    /// Arm the idle sweeper; 0 keeps it ticking with the check disabled
    pub fn set_timeout(&mut self, secs: u32) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        self.idle_timeout_secs = secs;

        if self.is_alive() {
            self.sweeper = Some(sweeper::spawn(
                self.sweep_period,
                self.context(),
                Arc::clone(&self.sweep_pending),
            ));
        }
    }

    /// Interval used by the next [`set_timeout`](Self::set_timeout)
    pub fn set_sweep_period(&mut self, period: Duration) {
        self.sweep_period = period;
    }

    /// Set framing for new connections from a `none|r|w|rw|wr` token
    pub fn set_enable_frame(&mut self, token: &str) {
        match token.parse::<FrameMode>() {
            Ok(mode) => self.frame_mode = mode,
            Err(e) => warn!("Unsupported frame flag: {}", e),
        }
    }

    /// Select the variant for new connections
    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.protocol = protocol;
    }

    // Introspection

    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.table.contains(id)
    }

    pub fn connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.table.get(id).map(Connection::info)
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<_> = self.table.iter().map(Connection::info).collect();
        list.sort_by_key(|info| info.id);
        list
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(Listener::addr)
    }

    pub fn frame_mode(&self) -> FrameMode {
        self.frame_mode
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Idle timeout in seconds, 0 when disabled
    pub fn idle_timeout(&self) -> u32 {
        self.idle_timeout_secs
    }

    // Teardown

    /// Close everything; returns how many connections were force-closed
    ///
    /// Later calls do nothing. Queued completions are discarded.
    pub fn destroy(&mut self) -> usize {
        if !self.is_alive() {
            return 0;
        }
        self.shutdown.send_replace(true);

        let connections = self.table.drain();
        let closed = connections.len();
        for mut conn in connections {
            conn.close(true);
            METRICS.connection_closed();
        }

        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        self.listener = None;
        while self.completions_rx.try_recv().is_ok() {}

        info!(closed, "Connection manager destroyed");
        closed
    }

    // Completion dispatch

    /// Wait for one completion and handle it
    ///
    /// Returns false once the manager is destroyed. Cancel-safe.
    pub async fn dispatch_next(&mut self) -> bool {
        if !self.is_alive() {
            return false;
        }
        match self.completions_rx.recv().await {
            Some(completion) => {
                self.handle(completion);
                true
            }
            None => false,
        }
    }

    /// Handle every completion already queued; returns how many ran
    pub fn run_pending(&mut self) -> usize {
        let mut handled = 0;
        while self.is_alive() {
            match self.completions_rx.try_recv() {
                Ok(completion) => {
                    self.handle(completion);
                    handled += 1;
                }
                Err(_) => break,
            }
        }
        handled
    }

    fn handle(&mut self, completion: Completion) {
        match completion {
            Completion::Accepted {
                stream,
                peer,
                epoch,
                reply_id,
            } => self.on_accepted(stream, peer, epoch, reply_id),
            Completion::AcceptFailed {
                error,
                epoch,
                reply_id,
            } => {
                if !self.is_current_listener(epoch) {
                    debug!(error = %error, "Dropping accept error of a replaced listener");
                    return;
                }
                METRICS.connection_failed();
                if reply_id != 0 {
                    let text = describe("tcp async_accept error", &error);
                    self.reply(text.as_bytes(), "error", reply_id, MessageType::Error);
                } else {
                    warn!(error = %error, "tcp async_accept error");
                }
            }
            Completion::Connected {
                stream,
                peer,
                reply_id,
            } => {
                let id = self.adopt(stream, peer, Direction::Dialed);
                self.reply(id.to_string().as_bytes(), "", reply_id, MessageType::Text);
            }
            Completion::ConnectFailed { error, reply_id } => {
                METRICS.connection_failed();
                debug!(reply_id, error = %error, "async_connect failed");
                let header = describe("error async_connect", &error);
                self.reply(b"", &header, reply_id, MessageType::Error);
            }
            Completion::Reply {
                data,
                header,
                reply_id,
                mtype,
            } => self.reply(&data, &header, reply_id, mtype),
            Completion::Socket { id, serial, event } => self.on_socket_event(id, serial, event),
            Completion::SweepTick => {
                self.sweep_pending.store(false, Ordering::Release);
                self.sweep();
            }
        }
    }

    fn on_accepted(&mut self, stream: TcpStream, peer: SocketAddr, epoch: u64, reply_id: i32) {
        if !self.is_current_listener(epoch) {
            debug!(%peer, "Dropping connection from a replaced listener");
            return;
        }

        let id = self.adopt(stream, peer, Direction::Accepted);
        if reply_id != 0 {
            self.reply(id.to_string().as_bytes(), "", reply_id, MessageType::Text);
        } else {
            self.async_accept(0);
        }
    }

    fn is_current_listener(&self, epoch: u64) -> bool {
        self.listener.as_ref().map(Listener::epoch) == Some(epoch)
    }

    /// Register and start a freshly accepted or dialed stream
    fn adopt(&mut self, stream: TcpStream, peer: SocketAddr, direction: Direction) -> ConnectionId {
        if let Err(e) = tune_stream(&stream) {
            debug!(%peer, error = %e, "Failed to tune socket");
        }
        if self.no_delay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let id = self.table.allocate_id();
        self.next_serial += 1;
        let mut conn = Connection::new(id, self.next_serial, self.protocol, self.frame_mode, stream, peer);
        conn.start(direction, self.context());
        self.table.insert(conn);

        METRICS.connection_opened();
        info!(conn_id = %id, %peer, ?direction, protocol = ?self.protocol, "Connection opened");

        if self.protocol == Protocol::Socket {
            self.emit(id, Protocol::Socket, open_event(direction), peer.to_string().as_bytes());
        }
        id
    }

    fn on_socket_event(&mut self, id: ConnectionId, serial: u64, event: ConnEvent) {
        let Some(conn) = self.table.get_mut(id).filter(|conn| conn.serial() == serial) else {
            trace!(conn_id = %id, serial, "Discarding event of a retired connection");
            return;
        };
        let protocol = conn.protocol();

        match event {
            ConnEvent::Opened => {
                conn.mark_open();
                let direction = conn.direction();
                let peer = conn.peer().to_string();
                debug!(conn_id = %id, %peer, "Websocket open");
                self.emit(id, protocol, open_event(direction), peer.as_bytes());
            }
            ConnEvent::Activity => conn.state_mut().touch(),
            ConnEvent::Data(data) => {
                conn.state_mut().record_rx(data.len() as u64);
                self.emit(id, protocol, SocketEvent::Message, &data);
            }
            ConnEvent::ReadDone { reply_id, data } => {
                conn.finish_read();
                conn.state_mut().record_rx(data.len() as u64);
                self.reply(&data, "", reply_id, MessageType::Text);
            }
            ConnEvent::ReadFailed { reply_id, error } => {
                conn.finish_read();
                self.reply(error.to_string().as_bytes(), "closed", reply_id, MessageType::Error);
                self.retire(id, CloseReason::Error(error));
            }
            ConnEvent::Closed(reason) => self.retire(id, reason),
        }
    }

    /// Drop a connection that ended on its own
    fn retire(&mut self, id: ConnectionId, reason: CloseReason) {
        let Some(mut conn) = self.table.remove(id) else {
            return;
        };
        conn.close(true);

        METRICS.connection_closed();
        match &reason {
            CloseReason::Timeout => METRICS.timeout(),
            CloseReason::Error(e) if !e.is_disconnect() => METRICS.error(),
            _ => {}
        }
        info!(
            conn_id = %id,
            peer = %conn.peer(),
            reason = %reason,
            bytes_rx = conn.state().bytes_rx,
            bytes_tx = conn.state().bytes_tx,
            "Connection closed"
        );

        let text = reason.to_string();
        if let Some(reply_id) = conn.finish_read() {
            self.reply(text.as_bytes(), "closed", reply_id, MessageType::Error);
        }
        if conn.protocol() != Protocol::Text {
            self.emit(id, conn.protocol(), SocketEvent::Close, text.as_bytes());
        }
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let secs = self.idle_timeout_secs;
        let expired: Vec<ConnectionId> = self
            .table
            .iter()
            .filter(|conn| conn.timeout_check(now, secs))
            .map(Connection::id)
            .collect();

        for id in expired {
            debug!(conn_id = %id, timeout_secs = secs, "Idle timeout");
            self.retire(id, CloseReason::Timeout);
        }
    }

    fn reply(&mut self, data: &[u8], header: &str, reply_id: i32, mtype: MessageType) {
        self.relay.reply(&mut self.owner, data, header, reply_id, mtype);
    }

    /// Notify the owner of a connection-level event
    fn emit(&mut self, id: ConnectionId, protocol: Protocol, event: SocketEvent, data: &[u8]) {
        let mtype = match protocol {
            Protocol::WebSocket => MessageType::SocketWs,
            _ => MessageType::Socket,
        };
        let mut msg = Message::with_payload(mtype, data);
        msg.set_sender(u32::from(id.as_u16()));
        msg.set_receiver(self.owner.id());
        msg.set_event(Some(event));
        self.owner.handle_message(&msg);
    }
}

impl<O: Owner> Drop for TcpManager<O> {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn open_event(direction: Direction) -> SocketEvent {
    match direction {
        Direction::Accepted => SocketEvent::Accept,
        Direction::Dialed => SocketEvent::Connect,
    }
}
