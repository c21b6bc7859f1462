//! # Metrics Collection
//!
//! Prometheus metrics for the sync loop. Without an installed exporter the
//! `metrics` macros are no-ops, so the recorder is always safe to call.

use std::net::SocketAddr;
use std::time::Duration;

use ::tracing::info;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};

/// Metrics recorder that tracks sidecar metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Create a new metrics recorder instance
    pub fn new() -> Self {
        Self
    }

    /// Record a classified fetch attempt
    pub fn record_fetch(&self, outcome: &'static str, duration: Duration) {
        counter!("sidecar_fetch_total", "outcome" => outcome).increment(1);
        histogram!("sidecar_fetch_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a secret written to disk
    pub fn record_secret_persisted(&self, bytes: usize) {
        counter!("sidecar_secret_writes_total").increment(1);
        gauge!("sidecar_secret_bytes").set(bytes as f64);
    }

    pub fn record_persist_failure(&self) {
        counter!("sidecar_persist_failures_total").increment(1);
    }

    /// Update the current poll interval gauge
    pub fn set_poll_interval(&self, interval: Duration) {
        gauge!("sidecar_poll_interval_seconds").set(interval.as_secs_f64());
    }

    /// Register sidecar metrics so Prometheus exports appear before events occur.
    pub fn register_sidecar_metrics(&self) {
        describe_counter!(
            "sidecar_fetch_total",
            Unit::Count,
            "Secret fetch attempts grouped by outcome"
        );
        describe_histogram!(
            "sidecar_fetch_duration_seconds",
            Unit::Seconds,
            "Duration of secret fetch attempts"
        );
        describe_counter!(
            "sidecar_secret_writes_total",
            Unit::Count,
            "Secrets written to the destination file"
        );
        describe_gauge!("sidecar_secret_bytes", Unit::Bytes, "Size of the last written secret");
        describe_counter!(
            "sidecar_persist_failures_total",
            Unit::Count,
            "Fetched secrets that could not be written"
        );
        describe_gauge!(
            "sidecar_poll_interval_seconds",
            Unit::Seconds,
            "Interval before the next fetch attempt"
        );

        const OUTCOMES: &[&str] =
            &["secret", "not_found", "transient_error", "untrusted_self", "untrusted_peer"];

        for outcome in OUTCOMES {
            counter!("sidecar_fetch_total", "outcome" => *outcome).absolute(0);
        }
        counter!("sidecar_secret_writes_total").absolute(0);
        counter!("sidecar_persist_failures_total").absolute(0);
    }
}

/// Initialize the Prometheus exporter. Returns `Ok(None)` when the metrics
/// port is 0.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<Option<MetricsRecorder>> {
    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => return Ok(None),
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        Error::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| Error::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    let recorder = MetricsRecorder::new();
    recorder.register_sidecar_metrics();

    info!(
        metrics_addr = %metrics_addr,
        service_name = %config.service_name,
        "Metrics collection initialized"
    );

    Ok(Some(recorder))
}
