//! Prometheus metrics module
//!
//! Counters are recorded through the `metrics` facade. Without an installed
//! recorder (library use, tests) every call is a no-op.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ProjectorError;
use crate::events::Opcode;

/// Projector metrics collector
#[derive(Clone)]
pub struct ProjectorMetrics {
    handle: Option<Arc<PrometheusHandle>>,
}

impl ProjectorMetrics {
    /// Install the Prometheus recorder and return a rendering collector
    pub fn install() -> Result<Self, ProjectorError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| ProjectorError::Config(format!("Failed to install Prometheus recorder: {e}")))?;

        Self::register_metrics();

        Ok(Self {
            handle: Some(Arc::new(handle)),
        })
    }

    /// Collector that records into whatever recorder is global, if any
    pub fn detached() -> Self {
        Self { handle: None }
    }

    /// Register metric descriptions
    fn register_metrics() {
        describe_counter!(
            "projector_events_received_total",
            Unit::Count,
            "Change-feed events processed by workers"
        );
        describe_counter!(
            "projector_payloads_delivered_total",
            Unit::Count,
            "Payloads delivered to sinks"
        );
        describe_counter!(
            "projector_sink_evictions_total",
            Unit::Count,
            "Sinks evicted after a failed delivery"
        );
        describe_counter!(
            "projector_transform_errors_total",
            Unit::Count,
            "Engine transform failures"
        );
        describe_counter!(
            "projector_update_seqno_total",
            Unit::Count,
            "Update-seqno signals for unindexed collections"
        );
        describe_counter!(
            "projector_errors_total",
            Unit::Count,
            "Total projector errors"
        );

        describe_histogram!(
            "projector_delivery_duration_seconds",
            Unit::Seconds,
            "Time to deliver one payload to one sink"
        );

        describe_gauge!(
            "projector_open_shards",
            Unit::Count,
            "Shard streams currently open per worker"
        );
        describe_gauge!(
            "projector_workers_alive",
            Unit::Count,
            "Workers whose event loop is running"
        );
        describe_gauge!(
            "projector_nats_connected",
            Unit::Count,
            "NATS connection status (1=connected, 0=disconnected)"
        );
    }

    /// Record an event taken off the data queue
    pub fn record_event(&self, worker_id: usize, opcode: Opcode) {
        counter!(
            "projector_events_received_total",
            "worker_id" => worker_id.to_string(),
            "opcode" => opcode.as_str()
        )
        .increment(1);
    }

    /// Record a successful delivery
    pub fn record_delivery(&self, worker_id: usize, duration: Duration) {
        counter!(
            "projector_payloads_delivered_total",
            "worker_id" => worker_id.to_string()
        )
        .increment(1);

        histogram!(
            "projector_delivery_duration_seconds",
            "worker_id" => worker_id.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a sink eviction
    pub fn record_eviction(&self, worker_id: usize, address: &str) {
        counter!(
            "projector_sink_evictions_total",
            "worker_id" => worker_id.to_string(),
            "address" => address.to_string()
        )
        .increment(1);
    }

    pub fn record_transform_error(&self, worker_id: usize, engine_id: u64) {
        counter!(
            "projector_transform_errors_total",
            "worker_id" => worker_id.to_string(),
            "engine_id" => engine_id.to_string()
        )
        .increment(1);
    }

    pub fn record_update_seqno(&self, worker_id: usize) {
        counter!(
            "projector_update_seqno_total",
            "worker_id" => worker_id.to_string()
        )
        .increment(1);
    }

    /// Record a projector error by type
    pub fn record_error(&self, worker_id: usize, error_type: &'static str) {
        counter!(
            "projector_errors_total",
            "worker_id" => worker_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }

    pub fn set_open_shards(&self, worker_id: usize, count: usize) {
        gauge!(
            "projector_open_shards",
            "worker_id" => worker_id.to_string()
        )
        .set(count as f64);
    }

    pub fn set_workers_alive(&self, keyspace: &str, count: usize) {
        gauge!(
            "projector_workers_alive",
            "keyspace" => keyspace.to_string()
        )
        .set(count as f64);
    }

    /// Set NATS connection status
    pub fn set_nats_connected(&self, connected: bool) {
        gauge!("projector_nats_connected").set(if connected { 1.0 } else { 0.0 });
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_metrics_render_nothing() {
        let metrics = ProjectorMetrics::detached();
        metrics.record_event(0, Opcode::Mutation);
        metrics.record_delivery(0, Duration::from_millis(2));
        metrics.set_open_shards(0, 3);
        assert!(metrics.render().is_empty());
    }
}
