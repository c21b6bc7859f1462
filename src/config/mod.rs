//! # Configuration Management
//!
//! The sidecar is configured entirely through environment variables (a
//! `.env` file is honoured by the binary). Values that are set but fail to
//! parse are configuration errors; unset or empty values take the default.

pub mod settings;

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::{Error, Result};

pub use settings::{
    AuthorityConfig, IdentityConfig, IdentitySourceKind, LogFormat, ObservabilityConfig,
    OutputConfig, PollingConfig, SidecarConfig,
};

pub const ENV_SPIFFE_ENDPOINT_SOCKET: &str = "SPIFFE_ENDPOINT_SOCKET";
pub const ENV_IDENTITY_SOURCE: &str = "FLOWPLANE_SIDECAR_IDENTITY_SOURCE";
pub const ENV_SVID_DIR: &str = "FLOWPLANE_SIDECAR_SVID_DIR";
pub const ENV_AUTHORITY_URL: &str = "FLOWPLANE_SIDECAR_AUTHORITY_URL";
pub const ENV_FETCH_METHOD: &str = "FLOWPLANE_SIDECAR_FETCH_METHOD";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "FLOWPLANE_SIDECAR_REQUEST_TIMEOUT_SECS";
pub const ENV_SECRETS_PATH: &str = "FLOWPLANE_SIDECAR_SECRETS_PATH";
pub const ENV_POLL_INTERVAL_MS: &str = "FLOWPLANE_SIDECAR_POLL_INTERVAL_MS";
pub const ENV_MAX_POLL_INTERVAL_MS: &str = "FLOWPLANE_SIDECAR_MAX_POLL_INTERVAL_MS";
pub const ENV_BACKOFF_FACTOR: &str = "FLOWPLANE_SIDECAR_BACKOFF_FACTOR";
pub const ENV_SUCCESS_THRESHOLD: &str = "FLOWPLANE_SIDECAR_SUCCESS_THRESHOLD";
pub const ENV_ERROR_THRESHOLD: &str = "FLOWPLANE_SIDECAR_ERROR_THRESHOLD";
pub const ENV_INIT_POLL_INTERVAL_MS: &str = "FLOWPLANE_SIDECAR_INIT_POLL_INTERVAL_MS";
pub const ENV_WORKLOAD_ID_PREFIXES: &str = "FLOWPLANE_SIDECAR_WORKLOAD_ID_PREFIXES";
pub const ENV_SERVER_ID_PREFIXES: &str = "FLOWPLANE_SIDECAR_SERVER_ID_PREFIXES";
pub const ENV_LOG_FORMAT: &str = "FLOWPLANE_SIDECAR_LOG_FORMAT";
pub const ENV_METRICS_PORT: &str = "FLOWPLANE_SIDECAR_METRICS_PORT";

impl SidecarConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup. Does not validate.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = SidecarConfig::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(Self {
            identity: IdentityConfig {
                source: parse_or(&get, ENV_IDENTITY_SOURCE, defaults.identity.source)?,
                endpoint_socket: get(ENV_SPIFFE_ENDPOINT_SOCKET)
                    .unwrap_or(defaults.identity.endpoint_socket),
                svid_dir: get(ENV_SVID_DIR).map(PathBuf::from).unwrap_or(defaults.identity.svid_dir),
            },
            authority: AuthorityConfig {
                url: get(ENV_AUTHORITY_URL).unwrap_or(defaults.authority.url),
                fetch_method: parse_or(&get, ENV_FETCH_METHOD, defaults.authority.fetch_method)?,
                request_timeout_secs: parse_or(
                    &get,
                    ENV_REQUEST_TIMEOUT_SECS,
                    defaults.authority.request_timeout_secs,
                )?,
                workload_id_prefixes: get(ENV_WORKLOAD_ID_PREFIXES)
                    .map(|v| split_list(&v))
                    .unwrap_or(defaults.authority.workload_id_prefixes),
                server_id_prefixes: get(ENV_SERVER_ID_PREFIXES)
                    .map(|v| split_list(&v))
                    .unwrap_or(defaults.authority.server_id_prefixes),
            },
            polling: PollingConfig {
                poll_interval_ms: parse_or(
                    &get,
                    ENV_POLL_INTERVAL_MS,
                    defaults.polling.poll_interval_ms,
                )?,
                max_poll_interval_ms: parse_or(
                    &get,
                    ENV_MAX_POLL_INTERVAL_MS,
                    defaults.polling.max_poll_interval_ms,
                )?,
                backoff_factor: parse_or(&get, ENV_BACKOFF_FACTOR, defaults.polling.backoff_factor)?,
                success_threshold: parse_or(
                    &get,
                    ENV_SUCCESS_THRESHOLD,
                    defaults.polling.success_threshold,
                )?,
                error_threshold: parse_or(
                    &get,
                    ENV_ERROR_THRESHOLD,
                    defaults.polling.error_threshold,
                )?,
                init_poll_interval_ms: parse_or(
                    &get,
                    ENV_INIT_POLL_INTERVAL_MS,
                    defaults.polling.init_poll_interval_ms,
                )?,
            },
            output: OutputConfig {
                secrets_path: get(ENV_SECRETS_PATH)
                    .map(PathBuf::from)
                    .unwrap_or(defaults.output.secrets_path),
            },
            observability: ObservabilityConfig {
                log_format: parse_or(&get, ENV_LOG_FORMAT, defaults.observability.log_format)?,
                metrics_port: parse_or(&get, ENV_METRICS_PORT, defaults.observability.metrics_port)?,
                service_name: defaults.observability.service_name,
            },
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| Error::config(format!("Invalid value '{}' for {}: {}", raw, key, e))),
        None => Ok(default),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
}
