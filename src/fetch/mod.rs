//! # Secret Fetching
//!
//! One fetch is one mutually authenticated request to the secrets authority,
//! reduced to a [`FetchOutcome`]. The sync loop only ever sees outcomes; it
//! never handles transport errors directly.

pub mod client;
pub mod wire;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::identity::{IdentityError, SpiffeId};

pub use client::{secrets_endpoint, AuthorizedFetcher, FetchMethod, SECRETS_API_PATH};
pub use wire::{SecretFetchRequest, SecretFetchResponse};

/// Secret content as delivered by the authority. The payload is written to
/// disk verbatim and replaces any previous content as a whole.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretPayload {
    data: String,
    created: Option<String>,
    updated: Option<String>,
}

impl SecretPayload {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into(), created: None, updated: None }
    }

    pub fn with_timestamps(mut self, created: Option<String>, updated: Option<String>) -> Self {
        self.created = created;
        self.updated = updated;
        self
    }

    /// Whether the authority holds a non-empty secret for this workload.
    pub fn is_present(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn created(&self) -> Option<&str> {
        self.created.as_deref()
    }

    pub fn updated(&self) -> Option<&str> {
        self.updated.as_deref()
    }
}

// Secret bytes must never reach the logs.
impl std::fmt::Debug for SecretPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretPayload")
            .field("len", &self.data.len())
            .field("created", &self.created)
            .field("updated", &self.updated)
            .finish()
    }
}

/// Retryable fetch failures.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("workload identity unavailable: {0}")]
    IdentityUnavailable(#[from] IdentityError),

    #[error("failed to build mTLS client: {0}")]
    Client(String),

    #[error("request to secrets authority failed: {0}")]
    Request(String),

    #[error("secrets authority responded with status {0}")]
    Status(u16),

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("failed to decode secrets response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("fetch did not complete within {0:?}")]
    Timeout(Duration),
}

/// The classified result of a single fetch attempt.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The authority returned a secret.
    Secret(SecretPayload),
    /// No secret has been provisioned for this workload yet.
    NotFound,
    /// Network, protocol or identity failure; safe to retry.
    TransientError(FetchError),
    /// Our own SVID is not on the workload allow-list. Retrying cannot help.
    UntrustedSelf(SpiffeId),
    /// The server failed identity verification during the handshake.
    UntrustedPeer(String),
}

impl FetchOutcome {
    /// Whether the outcome counts as a success for backoff purposes.
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Secret(_))
    }

    /// Stable label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Secret(_) => "secret",
            FetchOutcome::NotFound => "not_found",
            FetchOutcome::TransientError(_) => "transient_error",
            FetchOutcome::UntrustedSelf(_) => "untrusted_self",
            FetchOutcome::UntrustedPeer(_) => "untrusted_peer",
        }
    }
}

/// Anything that can produce a fetch outcome. Implemented by
/// [`AuthorizedFetcher`] and by test doubles.
#[async_trait]
pub trait SecretFetcher: Send + Sync {
    async fn fetch(&self) -> FetchOutcome;

    /// Where secrets are fetched from, for logs.
    fn target(&self) -> String {
        "secrets-authority".to_string()
    }
}
