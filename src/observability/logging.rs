//! # Structured Logging
//!
//! Text output for humans, JSON for log pipelines. The filter comes from
//! `RUST_LOG` and defaults to `info`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, SidecarConfig};
use crate::errors::{Error, Result};

/// Create a tracing span for one fetch attempt.
///
/// ```rust,ignore
/// let span = fetch_span!(fetcher.endpoint(), cycle = 3);
/// ```
#[macro_export]
macro_rules! fetch_span {
    ($endpoint:expr) => {
        tracing::info_span!(
            "secret_fetch",
            endpoint = %$endpoint,
            attempt_id = %uuid::Uuid::new_v4(),
            outcome = tracing::field::Empty
        )
    };
    ($endpoint:expr, $($field:tt)*) => {
        tracing::info_span!(
            "secret_fetch",
            endpoint = %$endpoint,
            attempt_id = %uuid::Uuid::new_v4(),
            outcome = tracing::field::Empty,
            $($field)*
        )
    };
}

/// Install the global subscriber. A subscriber that is already installed
/// (integration tests) is left in place.
pub fn init_logging(format: LogFormat, verbose: bool) -> Result<()> {
    let mut env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| Error::config(format!("Invalid RUST_LOG filter: {}", e)))?;

    if verbose {
        let directive = "flowplane_sidecar=debug"
            .parse()
            .map_err(|e| Error::internal(format!("Invalid log directive: {}", e)))?;
        env_filter = env_filter.add_directive(directive);
    }

    let registry = tracing_subscriber::registry().with(env_filter);
    // A subscriber installed earlier (tests, embedding binaries) wins.
    let _ = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(false).with_target(false))
            .try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).try_init(),
    };
    Ok(())
}

/// Log configuration at startup
pub fn log_config_info(config: &SidecarConfig, mode: &str) {
    tracing::info!(
        mode,
        identity_source = ?config.identity.source,
        authority_url = %config.authority.url,
        fetch_method = %config.authority.fetch_method,
        secrets_path = %config.output.secrets_path.display(),
        poll_interval_ms = config.polling.poll_interval_ms,
        max_poll_interval_ms = config.polling.max_poll_interval_ms,
        backoff_factor = config.polling.backoff_factor,
        metrics_enabled = config.observability.metrics_port != 0,
        "Flowplane sidecar configuration"
    );
}
