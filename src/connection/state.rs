//! Connection state

use serde::Serialize;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::NetError;

/// Manager-assigned connection handle, never 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(pub(crate) u16);

impl ConnectionId {
    /// Create from a raw value; 0 is not a valid id
    pub fn from_raw(id: u16) -> Option<Self> {
        (id != 0).then_some(Self(id))
    }

    /// Get raw value
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Socket events carry the id widened to the message sender field
impl TryFrom<u32> for ConnectionId {
    type Error = NetError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        u16::try_from(value)
            .ok()
            .and_then(Self::from_raw)
            .ok_or(NetError::InvalidSocket)
    }
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Produced by the listener
    Accepted,
    /// Produced by connect / async_connect
    Dialed,
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    /// Websocket handshake in progress
    Connecting,
    /// Connection is active and ready
    Active,
    /// Last write queued, socket closes once it is flushed
    Draining,
    /// Connection is closed
    Closed,
}

/// Per-connection activity state
#[derive(Debug)]
pub struct ConnectionState {
    /// Remote address
    pub peer: SocketAddr,
    /// Connection phase
    pub phase: ConnectionPhase,
    /// Connection start time
    pub connected_at: Instant,
    /// Last time data arrived from the peer
    pub last_active: Instant,
    /// Bytes received
    pub bytes_rx: u64,
    /// Bytes queued for sending
    pub bytes_tx: u64,
    /// Inbound messages (frames, chunks or read results)
    pub messages_rx: u64,
    /// Outbound messages
    pub messages_tx: u64,
}

impl ConnectionState {
    /// Create new connection state
    pub fn new(peer: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            peer,
            phase: ConnectionPhase::Connecting,
            connected_at: now,
            last_active: now,
            bytes_rx: 0,
            bytes_tx: 0,
            messages_rx: 0,
            messages_tx: 0,
        }
    }

    /// Mark connection as active
    pub fn set_active(&mut self) {
        self.phase = ConnectionPhase::Active;
        self.touch();
    }

    /// Mark connection as draining
    pub fn set_draining(&mut self) {
        self.phase = ConnectionPhase::Draining;
    }

    /// Mark connection as closed
    pub fn set_closed(&mut self) {
        self.phase = ConnectionPhase::Closed;
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Record received bytes
    pub fn record_rx(&mut self, bytes: u64) {
        self.bytes_rx = self.bytes_rx.saturating_add(bytes);
        self.messages_rx = self.messages_rx.saturating_add(1);
        self.touch();
    }

    /// Record queued bytes; sending does not count as activity
    pub fn record_tx(&mut self, bytes: u64) {
        self.bytes_tx = self.bytes_tx.saturating_add(bytes);
        self.messages_tx = self.messages_tx.saturating_add(1);
    }

    /// Get connection duration
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Time since the peer last sent anything, measured at `now`
    pub fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active)
    }

    /// No further writes are accepted
    pub fn is_closing(&self) -> bool {
        matches!(self.phase, ConnectionPhase::Draining | ConnectionPhase::Closed)
    }
}

/// Serializable connection information
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    /// Remote IP:port
    pub peer: String,
    pub direction: Direction,
    pub phase: ConnectionPhase,
    /// Duration in seconds
    pub duration_secs: f64,
    /// Idle time in seconds
    pub idle_secs: f64,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub messages_rx: u64,
    pub messages_tx: u64,
}

impl ConnectionInfo {
    pub(crate) fn new(id: ConnectionId, direction: Direction, state: &ConnectionState) -> Self {
        Self {
            id,
            peer: state.peer.to_string(),
            direction,
            phase: state.phase,
            duration_secs: state.duration().as_secs_f64(),
            idle_secs: state.idle_at(Instant::now()).as_secs_f64(),
            bytes_rx: state.bytes_rx,
            bytes_tx: state.bytes_tx,
            messages_rx: state.messages_rx,
            messages_tx: state.messages_tx,
        }
    }
}
