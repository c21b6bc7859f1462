//! # Observability Infrastructure
//!
//! Structured logging and Prometheus metrics for the sidecar.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, log_config_info};
pub use metrics::{init_metrics, MetricsRecorder};

use crate::config::ObservabilityConfig;
use crate::errors::Result;
use ::tracing::info;

/// Initialize logging, then metrics if a port is configured.
///
/// Must run inside a tokio runtime when metrics are enabled; the exporter
/// spawns its HTTP listener on it.
pub fn init_observability(config: &ObservabilityConfig, verbose: bool) -> Result<MetricsRecorder> {
    init_logging(config.log_format, verbose)?;

    let exporter = init_metrics(config)?;

    info!(
        service_name = %config.service_name,
        log_format = ?config.log_format,
        metrics_enabled = exporter.is_some(),
        "Observability initialized successfully"
    );

    Ok(exporter.unwrap_or_default())
}
