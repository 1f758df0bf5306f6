//! Atomic counters for hot-path metrics
//!
//! Lock-free counters shared by every manager in the process.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance
pub static METRICS: Metrics = Metrics::new();

/// Atomic metrics counters
pub struct Metrics {
    // Connection metrics
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_failed: AtomicU64,

    // Traffic metrics
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,

    // Request/reply metrics
    pub replies_sent: AtomicU64,

    // Error metrics
    pub errors_total: AtomicU64,
    pub timeouts_total: AtomicU64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_failed: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            replies_sent: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
        }
    }

    // Connection tracking
    #[inline]
    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    // Traffic tracking
    #[inline]
    pub fn bytes_rx(&self, count: u64) {
        self.bytes_received.fetch_add(count, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn bytes_tx(&self, count: u64) {
        self.bytes_sent.fetch_add(count, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn reply(&self) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking
    #[inline]
    pub fn error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics for reporting
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_failed: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub replies_sent: u64,
    pub errors_total: u64,
    pub timeouts_total: u64,
}
