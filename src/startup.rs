//! Startup wiring for the sidecar
//!
//! Turns a validated [`SidecarConfig`] into an identity source, a fetcher
//! and either the sync loop or the init probe.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{IdentitySourceKind, SidecarConfig};
use crate::errors::Result;
use crate::fetch::AuthorizedFetcher;
use crate::identity::{FileIdentitySource, IdentitySource, WorkloadApiSource};
use crate::observability::MetricsRecorder;
use crate::storage::FileSecretStore;
use crate::sync::{InitProbe, LoopExit, ProbeExit, SyncLoop};

/// Slack on top of the request timeout before the loop gives up on a fetch.
const FETCH_DEADLINE_MARGIN: Duration = Duration::from_secs(5);

pub struct Sidecar {
    config: SidecarConfig,
    identity: Arc<dyn IdentitySource>,
    metrics: MetricsRecorder,
}

impl Sidecar {
    /// Build the identity source. Must be called inside a tokio runtime; the
    /// Workload API watcher runs until `shutdown` is cancelled.
    pub fn new(
        config: SidecarConfig,
        metrics: MetricsRecorder,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let identity: Arc<dyn IdentitySource> = match config.identity.source {
            IdentitySourceKind::WorkloadApi => {
                let address = config.workload_api_address()?;
                info!(address = %config.identity.endpoint_socket, "Watching SPIFFE Workload API");
                Arc::new(WorkloadApiSource::spawn(address, shutdown.child_token()))
            }
            IdentitySourceKind::Files => {
                info!(dir = %config.identity.svid_dir.display(), "Reading SVID files");
                Arc::new(FileIdentitySource::from_dir(&config.identity.svid_dir))
            }
        };

        Ok(Self { config, identity, metrics })
    }

    pub fn fetcher(&self) -> Result<Arc<AuthorizedFetcher>> {
        let fetcher = AuthorizedFetcher::new(
            Arc::clone(&self.identity),
            self.config.allow_lists(),
            self.config.secrets_endpoint()?,
        )
        .with_method(self.config.authority.fetch_method)
        .with_request_timeout(self.config.request_timeout());
        Ok(Arc::new(fetcher))
    }

    fn fetch_deadline(&self) -> Duration {
        self.config.request_timeout() + FETCH_DEADLINE_MARGIN
    }

    /// Keep the secret file in sync until shutdown or a fatal refusal.
    pub async fn watch(&self, shutdown: CancellationToken) -> Result<LoopExit> {
        let store = Arc::new(FileSecretStore::new(self.config.output.secrets_path.clone()));
        let mut sync = SyncLoop::new(self.fetcher()?, store, self.config.backoff_policy())
            .with_fetch_deadline(self.fetch_deadline())
            .with_metrics(self.metrics.clone());

        Ok(sync.run(shutdown).await)
    }

    /// Block until the authority holds a secret for this workload.
    pub async fn init(&self, shutdown: CancellationToken) -> Result<ProbeExit> {
        let probe = InitProbe::new(self.fetcher()?, self.config.init_poll_interval())
            .with_fetch_deadline(self.fetch_deadline());

        Ok(probe.run(shutdown).await)
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
pub fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }

        info!("Shutdown signal received");
        token.cancel();
    });
}
