//! Connection table and id allocation

use std::collections::HashMap;

use super::state::ConnectionId;
use super::Connection;

/// Highest id handed out; the counter wraps back to 1 after it
pub const MAX_ID: u16 = 0xFFFE;

/// 16-bit wraparound id allocator
///
/// Ids run from 1 to [`MAX_ID`]; candidates still in use are skipped.
#[derive(Debug)]
pub struct IdAllocator {
    next: u16,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Next id for which `in_use` is false
    ///
    /// Never returns 0. Does not terminate if every id is taken.
    pub fn allocate(&mut self, in_use: impl Fn(ConnectionId) -> bool) -> ConnectionId {
        loop {
            let candidate = ConnectionId(self.next);
            self.next = if self.next >= MAX_ID { 1 } else { self.next + 1 };
            if !in_use(candidate) {
                return candidate;
            }
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Live connections keyed by id
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: HashMap<ConnectionId, Connection>,
    ids: IdAllocator,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id not held by any live connection
    pub fn allocate_id(&mut self) -> ConnectionId {
        let connections = &self.connections;
        self.ids.allocate(|id| connections.contains_key(&id))
    }

    pub fn insert(&mut self, conn: Connection) {
        self.connections.insert(conn.id(), conn);
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Remove every connection
    pub fn drain(&mut self) -> Vec<Connection> {
        self.connections.drain().map(|(_, conn)| conn).collect()
    }
}
