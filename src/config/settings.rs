//! # Configuration Settings
//!
//! Defines the configuration structure for the Flowplane sidecar.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;
use validator::Validate;

use crate::authz::{AllowLists, PrefixAllowList};
use crate::backoff::BackoffPolicy;
use crate::errors::{Error, Result};
use crate::fetch::{secrets_endpoint, FetchMethod};
use crate::identity::WorkloadApiAddress;

/// Main sidecar configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct SidecarConfig {
    /// Where the workload identity comes from
    #[validate(nested)]
    pub identity: IdentityConfig,

    /// Secrets authority connection settings
    #[validate(nested)]
    pub authority: AuthorityConfig,

    /// Poll scheduling
    #[validate(nested)]
    pub polling: PollingConfig,

    /// Where the secret is written
    #[validate(nested)]
    pub output: OutputConfig,

    /// Logging and metrics
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl SidecarConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)?;
        self.validate_custom()
    }

    /// Checks the validator attributes cannot express
    fn validate_custom(&self) -> Result<()> {
        let url = self.authority_url()?;
        if url.scheme() != "https" {
            return Err(Error::config(format!(
                "Authority URL must use https, got '{}'",
                url.scheme()
            )));
        }

        for prefix in
            self.authority.workload_id_prefixes.iter().chain(&self.authority.server_id_prefixes)
        {
            if !prefix.starts_with("spiffe://") {
                return Err(Error::config(format!(
                    "Allow-list prefix '{}' must start with spiffe://",
                    prefix
                )));
            }
        }

        if self.output.secrets_path.file_name().is_none() {
            return Err(Error::config(format!(
                "Secrets path '{}' must name a file",
                self.output.secrets_path.display()
            )));
        }

        if self.identity.source == IdentitySourceKind::WorkloadApi {
            self.workload_api_address()?;
        }

        if self.polling.poll_interval_ms > self.polling.max_poll_interval_ms {
            warn!(
                poll_interval_ms = self.polling.poll_interval_ms,
                max_poll_interval_ms = self.polling.max_poll_interval_ms,
                "Poll interval exceeds the maximum; clamping to the maximum"
            );
        }

        Ok(())
    }

    pub fn authority_url(&self) -> Result<Url> {
        Url::parse(&self.authority.url).map_err(|e| {
            Error::config(format!("Invalid authority URL '{}': {}", self.authority.url, e))
        })
    }

    /// Full URL of the secrets API.
    pub fn secrets_endpoint(&self) -> Result<Url> {
        let base = self.authority_url()?;
        secrets_endpoint(&base)
            .map_err(|e| Error::config(format!("Invalid secrets endpoint: {}", e)))
    }

    pub fn workload_api_address(&self) -> Result<WorkloadApiAddress> {
        WorkloadApiAddress::parse(&self.identity.endpoint_socket)
            .map_err(|e| Error::config(e.to_string()))
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.polling.poll_interval_ms),
            Duration::from_millis(self.polling.max_poll_interval_ms),
            self.polling.backoff_factor,
            self.polling.success_threshold,
            self.polling.error_threshold,
        )
    }

    pub fn allow_lists(&self) -> AllowLists {
        AllowLists::new(
            PrefixAllowList::new(self.authority.workload_id_prefixes.iter().cloned()),
            PrefixAllowList::new(self.authority.server_id_prefixes.iter().cloned()),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.authority.request_timeout_secs)
    }

    pub fn init_poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.init_poll_interval_ms)
    }
}

/// Which identity source feeds the fetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySourceKind {
    /// Stream SVIDs from the SPIFFE Workload API
    #[default]
    WorkloadApi,
    /// Read SVID files kept current by a SPIFFE helper
    Files,
}

impl FromStr for IdentitySourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "workload_api" | "workload-api" => Ok(Self::WorkloadApi),
            "files" => Ok(Self::Files),
            other => Err(format!("unknown identity source '{}'", other)),
        }
    }
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IdentityConfig {
    pub source: IdentitySourceKind,

    /// Workload API address (`unix:///path` or `tcp://ip:port`)
    #[validate(length(min = 1, message = "Workload API socket cannot be empty"))]
    pub endpoint_socket: String,

    /// Directory holding `svid.pem`, `svid_key.pem` and `svid_bundle.pem`
    pub svid_dir: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            source: IdentitySourceKind::WorkloadApi,
            endpoint_socket: "unix:///spire-agent-socket/agent.sock".to_string(),
            svid_dir: PathBuf::from("/run/spiffe"),
        }
    }
}

/// Secrets authority configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AuthorityConfig {
    /// Base URL of the authority
    #[validate(url(message = "Authority URL must be a valid URL"))]
    pub url: String,

    pub fetch_method: FetchMethod,

    /// Deadline for a single fetch in seconds
    #[validate(range(min = 1, max = 300, message = "Request timeout must be between 1 and 300 seconds"))]
    pub request_timeout_secs: u64,

    /// SPIFFE ID prefixes of workloads entitled to fetch
    #[validate(length(min = 1, message = "At least one workload ID prefix is required"))]
    pub workload_id_prefixes: Vec<String>,

    /// SPIFFE ID prefixes the authority may present
    #[validate(length(min = 1, message = "At least one server ID prefix is required"))]
    pub server_id_prefixes: Vec<String>,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            url: "https://secrets-authority.flowplane-system.svc.cluster.local:8443".to_string(),
            fetch_method: FetchMethod::Get,
            request_timeout_secs: 10,
            workload_id_prefixes: vec!["spiffe://flowplane.local/workload/".to_string()],
            server_id_prefixes: vec![
                "spiffe://flowplane.local/workload/secrets-authority/".to_string()
            ],
        }
    }
}

/// Poll scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PollingConfig {
    #[validate(range(min = 1, message = "Poll interval must be at least 1ms"))]
    pub poll_interval_ms: u64,

    #[validate(range(min = 1, message = "Max poll interval must be at least 1ms"))]
    pub max_poll_interval_ms: u64,

    #[validate(range(min = 1, max = 64, message = "Backoff factor must be between 1 and 64"))]
    pub backoff_factor: u32,

    #[validate(range(min = 1, message = "Success threshold must be at least 1"))]
    pub success_threshold: u32,

    #[validate(range(min = 1, message = "Error threshold must be at least 1"))]
    pub error_threshold: u32,

    /// Fixed interval of the init probe
    #[validate(range(min = 1, message = "Init poll interval must be at least 1ms"))]
    pub init_poll_interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 20_000,
            max_poll_interval_ms: 300_000,
            backoff_factor: 2,
            success_threshold: 3,
            error_threshold: 2,
            init_poll_interval_ms: 5_000,
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OutputConfig {
    /// File the secret is written to
    pub secrets_path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { secrets_path: PathBuf::from("/opt/flowplane/secrets.json") }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Observability configuration for logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,

    /// Prometheus exporter port (0 = disabled)
    pub metrics_port: u16,

    /// Value of the `service` label on exported metrics
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Text,
            metrics_port: 0,
            service_name: "flowplane-sidecar".to_string(),
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}
