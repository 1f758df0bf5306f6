//! svcnet - per-service TCP connection manager
//!
//! Accepts, dials, frames, reads, writes, times out and tears down TCP
//! connections on behalf of one service, and relays completions back to it
//! as discrete messages.

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod server;
pub mod util;

pub use codec::{FrameMode, ReadMode};
pub use config::{Config, Protocol};
pub use connection::ConnectionId;
pub use error::{NetError, Result};
pub use manager::{Mailbox, Owner, TcpManager};
pub use message::{Message, MessageType, SocketEvent};

/// Crate version for display
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
