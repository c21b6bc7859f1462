//! mTLS client for the secrets authority.
//!
//! Every call to [`AuthorizedFetcher::fetch`] reads the identity that is
//! current at that moment, builds a fresh rustls configuration and HTTP
//! client around it, sends a single request and drops the connection.
//! Nothing is pooled, so a rotated SVID is used by the very next attempt.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONNECTION;
use reqwest::StatusCode;
use rustls::crypto::CryptoProvider;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::wire::{SecretFetchRequest, SecretFetchResponse};
use super::{FetchError, FetchOutcome, SecretFetcher, SecretPayload};
use crate::authz::{AllowLists, SpiffeServerVerifier};
use crate::identity::{IdentitySource, WorkloadIdentity};

/// Path of the workload secrets API on the authority.
pub const SECRETS_API_PATH: &str = "/workload/v1/secrets";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP method used to ask for the secret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMethod {
    #[default]
    Get,
    /// Sends an empty JSON envelope as the body.
    Post,
}

impl FromStr for FetchMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "get" => Ok(FetchMethod::Get),
            "post" => Ok(FetchMethod::Post),
            other => Err(format!("unsupported fetch method '{other}', expected get or post")),
        }
    }
}

impl fmt::Display for FetchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchMethod::Get => f.write_str("GET"),
            FetchMethod::Post => f.write_str("POST"),
        }
    }
}

/// Join the authority base URL with the secrets API path.
pub fn secrets_endpoint(base: &Url) -> Result<Url, url::ParseError> {
    Url::parse(&format!("{}{}", base.as_str().trim_end_matches('/'), SECRETS_API_PATH))
}

pub struct AuthorizedFetcher {
    identity: Arc<dyn IdentitySource>,
    allow_lists: AllowLists,
    endpoint: Url,
    method: FetchMethod,
    request_timeout: Duration,
    provider: Arc<CryptoProvider>,
}

impl AuthorizedFetcher {
    /// `endpoint` is the full secrets URL, see [`secrets_endpoint`].
    pub fn new(identity: Arc<dyn IdentitySource>, allow_lists: AllowLists, endpoint: Url) -> Self {
        Self {
            identity,
            allow_lists,
            endpoint,
            method: FetchMethod::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    pub fn with_method(mut self, method: FetchMethod) -> Self {
        self.method = method;
        self
    }

    /// Deadline covering connect, handshake and body.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn build_verifier(
        &self,
        identity: &WorkloadIdentity,
    ) -> Result<Arc<SpiffeServerVerifier>, FetchError> {
        let roots = identity.bundle().root_store()?;
        Ok(Arc::new(SpiffeServerVerifier::new(
            Arc::new(roots),
            self.allow_lists.clone(),
            Arc::clone(&self.provider),
        )))
    }

    fn build_client(
        &self,
        identity: &WorkloadIdentity,
        verifier: Arc<SpiffeServerVerifier>,
    ) -> Result<reqwest::Client, FetchError> {
        let svid = identity.svid();

        let tls = rustls::ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| FetchError::Client(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(svid.cert_chain().to_vec(), svid.private_key().clone_key())
            .map_err(|e| FetchError::Client(e.to_string()))?;

        reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .pool_max_idle_per_host(0)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(self.request_timeout)
            .timeout(self.request_timeout)
            .https_only(true)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))
    }

    async fn classify(response: reqwest::Response) -> FetchOutcome {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return FetchOutcome::NotFound;
        }
        if !status.is_success() {
            return FetchOutcome::TransientError(FetchError::Status(status.as_u16()));
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return FetchOutcome::TransientError(FetchError::Body(error_chain(&e))),
        };

        match serde_json::from_slice::<SecretFetchResponse>(&body) {
            Ok(envelope) => FetchOutcome::Secret(SecretPayload::from(envelope)),
            Err(e) => FetchOutcome::TransientError(FetchError::Decode(e)),
        }
    }
}

impl fmt::Debug for AuthorizedFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizedFetcher")
            .field("endpoint", &self.endpoint.as_str())
            .field("method", &self.method)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SecretFetcher for AuthorizedFetcher {
    async fn fetch(&self) -> FetchOutcome {
        let identity = match self.identity.current() {
            Ok(identity) => identity,
            Err(e) => return FetchOutcome::TransientError(e.into()),
        };

        let own_id = identity.svid().spiffe_id();
        if !self.allow_lists.is_entitled_workload(own_id) {
            return FetchOutcome::UntrustedSelf(own_id.clone());
        }

        let verifier = match self.build_verifier(&identity) {
            Ok(verifier) => verifier,
            Err(e) => return FetchOutcome::TransientError(e),
        };
        let client = match self.build_client(&identity, Arc::clone(&verifier)) {
            Ok(client) => client,
            Err(e) => return FetchOutcome::TransientError(e),
        };

        debug!(method = %self.method, url = %self.endpoint, spiffe_id = %own_id, "Fetching secret");

        let request = match self.method {
            FetchMethod::Get => client.get(self.endpoint.clone()),
            FetchMethod::Post => client.post(self.endpoint.clone()).json(&SecretFetchRequest::default()),
        }
        .header(CONNECTION, "close");

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                if let Some(rejection) = verifier.take_rejection() {
                    return FetchOutcome::UntrustedPeer(rejection.to_string());
                }
                if e.is_timeout() {
                    return FetchOutcome::TransientError(FetchError::Timeout(self.request_timeout));
                }
                return FetchOutcome::TransientError(FetchError::Request(error_chain(&e)));
            }
        };

        let outcome = Self::classify(response).await;
        if let FetchOutcome::Secret(payload) = &outcome {
            info!(bytes = payload.len(), "Received secret from authority");
        }
        outcome
    }

    fn target(&self) -> String {
        self.endpoint.to_string()
    }
}

/// Render an error with all of its sources, since reqwest keeps the useful
/// part (TLS alert, connection refused) a few levels down.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
