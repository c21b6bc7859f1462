//! # Secret Sync Loop
//!
//! Wait, fetch, classify, persist, adjust the interval, repeat. Each cycle
//! sleeps exactly once for the interval computed by the previous cycle, so
//! an adjustment always applies to the very next wait and fetches never
//! overlap.
//!
//! The loop only stops when the workload is not entitled to secrets at all
//! or when shutdown is requested between cycles.

pub mod probe;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument, Span};

use crate::backoff::{BackoffPolicy, BackoffState};
use crate::fetch::{FetchError, FetchOutcome, SecretFetcher};
use crate::identity::SpiffeId;
use crate::observability::MetricsRecorder;
use crate::storage::SecretStore;

pub use probe::{InitProbe, ProbeExit};

/// Upper bound on a single fetch, on top of the HTTP client's own timeout.
pub const DEFAULT_FETCH_DEADLINE: Duration = Duration::from_secs(30);

/// Result of one loop cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    /// Wait this long, then run the next cycle.
    Continue(Duration),
    /// The workload is not entitled to fetch; stop for good.
    Fatal(SpiffeId),
}

/// Why [`SyncLoop::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    SelfNotEntitled(SpiffeId),
    Shutdown,
}

pub struct SyncLoop {
    fetcher: Arc<dyn SecretFetcher>,
    store: Arc<dyn SecretStore>,
    policy: BackoffPolicy,
    state: BackoffState,
    fetch_deadline: Duration,
    metrics: MetricsRecorder,
    cycles: u64,
}

impl SyncLoop {
    pub fn new(
        fetcher: Arc<dyn SecretFetcher>,
        store: Arc<dyn SecretStore>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            fetcher,
            store,
            state: policy.initial_state(),
            policy,
            fetch_deadline: DEFAULT_FETCH_DEADLINE,
            metrics: MetricsRecorder::new(),
            cycles: 0,
        }
    }

    pub fn with_fetch_deadline(mut self, deadline: Duration) -> Self {
        self.fetch_deadline = deadline;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsRecorder) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn state(&self) -> BackoffState {
        self.state
    }

    /// Run one fetch cycle and return what the loop should do next.
    pub async fn step(&mut self) -> Cycle {
        self.cycles += 1;
        let span = crate::fetch_span!(self.fetcher.target(), cycle = self.cycles);

        async {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.fetch_deadline, self.fetcher.fetch()).await
            {
                Ok(outcome) => outcome,
                Err(_) => FetchOutcome::TransientError(FetchError::Timeout(self.fetch_deadline)),
            };

            Span::current().record("outcome", outcome.label());
            self.metrics.record_fetch(outcome.label(), started.elapsed());

            let success = outcome.is_success();
            match outcome {
                FetchOutcome::Secret(payload) => {
                    if let Err(e) = self.store.save(&payload).await {
                        // Not applied yet: keep the schedule and refetch next cycle.
                        error!(error = %e, "Failed to persist secret");
                        self.metrics.record_persist_failure();
                        return Cycle::Continue(self.state.interval());
                    }
                    info!(bytes = payload.len(), "Secret synchronized");
                    self.metrics.record_secret_persisted(payload.len());
                }
                FetchOutcome::NotFound => info!("Secret not provisioned for this workload yet"),
                FetchOutcome::TransientError(e) => warn!(error = %e, "Secret fetch failed"),
                FetchOutcome::UntrustedPeer(reason) => {
                    warn!(reason = %reason, "Secrets authority failed identity verification")
                }
                FetchOutcome::UntrustedSelf(id) => {
                    error!(spiffe_id = %id, "Workload is not entitled to fetch secrets");
                    return Cycle::Fatal(id);
                }
            }

            let previous = self.state.interval();
            let (interval, next) = self.state.next(&self.policy, success);
            self.state = next;

            if interval != previous {
                info!(
                    from_ms = previous.as_millis() as u64,
                    to_ms = interval.as_millis() as u64,
                    "Adjusted poll interval"
                );
            }
            self.metrics.set_poll_interval(interval);

            Cycle::Continue(interval)
        }
        .instrument(span)
        .await
    }

    /// Loop until the workload turns out not to be entitled or `shutdown`
    /// is cancelled. A fetch in flight is allowed to finish.
    pub async fn run(&mut self, shutdown: CancellationToken) -> LoopExit {
        let mut wait = self.state.interval();
        info!(initial_interval_ms = wait.as_millis() as u64, "Starting secret sync loop");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping sync loop");
                    return LoopExit::Shutdown;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match self.step().await {
                Cycle::Continue(next) => wait = next,
                Cycle::Fatal(id) => return LoopExit::SelfNotEntitled(id),
            }
        }
    }
}
