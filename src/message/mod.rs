//! Boundary message types
//!
//! The envelope handed to the owning service, and the cluster wire
//! envelope used when messages travel between nodes.

pub mod cluster;
mod envelope;

pub use envelope::{Message, MessageType, ServiceId, SocketEvent};
