//! Init-container probe.
//!
//! Polls at a fixed interval until the authority holds a non-empty secret
//! for this workload. There is no backoff: the probe only lives until the
//! workload starts.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use super::DEFAULT_FETCH_DEADLINE;
use crate::fetch::{FetchError, FetchOutcome, SecretFetcher};
use crate::identity::SpiffeId;

/// Why [`InitProbe::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeExit {
    /// A non-empty secret exists; the workload may start.
    Ready,
    SelfNotEntitled(SpiffeId),
    Shutdown,
}

pub struct InitProbe {
    fetcher: Arc<dyn SecretFetcher>,
    interval: Duration,
    fetch_deadline: Duration,
}

impl InitProbe {
    pub fn new(fetcher: Arc<dyn SecretFetcher>, interval: Duration) -> Self {
        Self { fetcher, interval, fetch_deadline: DEFAULT_FETCH_DEADLINE }
    }

    pub fn with_fetch_deadline(mut self, deadline: Duration) -> Self {
        self.fetch_deadline = deadline;
        self
    }

    /// Poll once. `None` means keep waiting.
    pub async fn check(&self) -> Option<ProbeExit> {
        let span = crate::fetch_span!(self.fetcher.target(), probe = true);

        async {
            let outcome = tokio::time::timeout(self.fetch_deadline, self.fetcher.fetch())
                .await
                .unwrap_or(FetchOutcome::TransientError(FetchError::Timeout(self.fetch_deadline)));
            tracing::Span::current().record("outcome", outcome.label());

            match outcome {
                FetchOutcome::Secret(payload) if payload.is_present() => {
                    info!(bytes = payload.len(), "Secret is available");
                    Some(ProbeExit::Ready)
                }
                FetchOutcome::UntrustedSelf(id) => {
                    error!(spiffe_id = %id, "Workload is not entitled to fetch secrets");
                    Some(ProbeExit::SelfNotEntitled(id))
                }
                other => {
                    debug!(outcome = other.label(), "Secret not available yet");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Poll until the secret is ready, the workload is refused, or shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> ProbeExit {
        info!(interval_ms = self.interval.as_millis() as u64, "Waiting for secret");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return ProbeExit::Shutdown,
                _ = tokio::time::sleep(self.interval) => {}
            }

            if let Some(exit) = self.check().await {
                return exit;
            }
        }
    }
}
