//! Prometheus metrics exporter
//!
//! HTTP endpoint for Prometheus scraping.

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use super::counters::{MetricsSnapshot, METRICS};
use crate::config::MetricsConfig;

/// Initialize the Prometheus metrics exporter
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    describe_counter!("svcnet_connections_total", "Total connections opened");
    describe_gauge!("svcnet_connections_active", "Currently open connections");
    describe_counter!("svcnet_connections_failed", "Failed accept and connect attempts");
    describe_counter!("svcnet_bytes_received", "Total bytes received");
    describe_counter!("svcnet_bytes_sent", "Total bytes sent");
    describe_counter!("svcnet_messages_received", "Total inbound messages");
    describe_counter!("svcnet_messages_sent", "Total outbound messages");
    describe_counter!("svcnet_replies_sent", "Total replies relayed to services");
    describe_counter!("svcnet_errors_total", "Total connection errors");
    describe_counter!("svcnet_timeouts_total", "Total idle timeouts");

    PrometheusBuilder::new()
        .with_http_listener(config.bind_addr)
        .install()?;

    tokio::spawn(sync_metrics_task());

    Ok(())
}

/// Background task that periodically syncs our atomic counters to the metrics crate
async fn sync_metrics_task() {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    let mut last = MetricsSnapshot::default();

    loop {
        interval.tick().await;
        let snapshot = METRICS.snapshot();

        let deltas = [
            ("svcnet_connections_total", snapshot.connections_total, last.connections_total),
            ("svcnet_connections_failed", snapshot.connections_failed, last.connections_failed),
            ("svcnet_bytes_received", snapshot.bytes_received, last.bytes_received),
            ("svcnet_bytes_sent", snapshot.bytes_sent, last.bytes_sent),
            ("svcnet_messages_received", snapshot.messages_received, last.messages_received),
            ("svcnet_messages_sent", snapshot.messages_sent, last.messages_sent),
            ("svcnet_replies_sent", snapshot.replies_sent, last.replies_sent),
            ("svcnet_errors_total", snapshot.errors_total, last.errors_total),
            ("svcnet_timeouts_total", snapshot.timeouts_total, last.timeouts_total),
        ];
        for (name, now, before) in deltas {
            let delta = now.saturating_sub(before);
            if delta > 0 {
                counter!(name).increment(delta);
            }
        }

        gauge!("svcnet_connections_active").set(snapshot.connections_active as f64);

        last = snapshot;
    }
}
