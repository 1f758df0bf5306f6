//! Metrics and observability
//!
//! Atomic counters for the hot path, exported to Prometheus on demand.

mod counters;
mod exporter;

pub use counters::*;
pub use exporter::init_metrics;
