//! # Workload Identity
//!
//! The sidecar authenticates to the secrets authority with an X.509 SVID
//! issued by the SPIFFE identity system, and authenticates the authority
//! against the trust bundle delivered alongside it. Both rotate underneath
//! the sidecar; callers must ask an [`IdentitySource`] for the current
//! identity on every fetch and hold the returned `Arc` only for the
//! duration of that attempt.

pub mod files;
pub mod spiffe_id;
pub mod workload_api;

#[cfg(test)]
pub(crate) mod test_support;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use thiserror::Error;
use x509_parser::prelude::*;

use crate::errors::TlsError;

pub use files::FileIdentitySource;
pub use spiffe_id::{spiffe_id_from_der, SpiffeId, SpiffeIdError};
pub use workload_api::{WorkloadApiAddress, WorkloadApiSource};

/// Failures obtaining or interpreting the workload identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// No identity has been received from the identity system yet.
    #[error("workload identity is not available yet")]
    NotReady,

    /// The identity system returned a response without any SVID.
    #[error("identity response did not contain an X.509 SVID")]
    MissingSvid,

    /// The current SVID is past its expiry.
    #[error("X.509 SVID for {id} expired at {not_after}")]
    Expired { id: SpiffeId, not_after: DateTime<Utc> },

    #[error("invalid SPIFFE ID: {0}")]
    InvalidSpiffeId(#[from] SpiffeIdError),

    #[error("invalid certificate material: {0}")]
    Certificate(String),

    #[error("trust bundle does not contain any usable root certificate")]
    EmptyBundle,

    #[error("failed to load SVID files: {0}")]
    Files(#[from] TlsError),

    #[error("invalid Workload API address '{0}'")]
    InvalidAddress(String),

    #[error("Workload API transport error: {0}")]
    Transport(String),
}

/// An X.509 SVID: the certificate chain and key proving a SPIFFE ID.
pub struct X509Svid {
    spiffe_id: SpiffeId,
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    not_after: DateTime<Utc>,
}

impl X509Svid {
    /// Build an SVID from its chain (leaf first) and private key. The SPIFFE
    /// ID and expiry are read from the leaf.
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, IdentityError> {
        let leaf = cert_chain.first().ok_or(IdentityError::MissingSvid)?;
        let (_, parsed) = X509Certificate::from_der(leaf.as_ref())
            .map_err(|e| IdentityError::Certificate(e.to_string()))?;

        let spiffe_id = spiffe_id::spiffe_id_from_cert(&parsed)?;
        let not_after = Utc
            .timestamp_opt(parsed.validity().not_after.timestamp(), 0)
            .single()
            .ok_or_else(|| IdentityError::Certificate("SVID expiry out of range".to_string()))?;

        Ok(Self { spiffe_id, cert_chain, private_key, not_after })
    }

    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }
}

impl fmt::Debug for X509Svid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509Svid")
            .field("spiffe_id", &self.spiffe_id.to_string())
            .field("chain_len", &self.cert_chain.len())
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Root certificates used to validate peer SVIDs.
#[derive(Debug, Clone)]
pub struct TrustBundle {
    roots: Vec<CertificateDer<'static>>,
}

impl TrustBundle {
    pub fn new(roots: Vec<CertificateDer<'static>>) -> Result<Self, IdentityError> {
        if roots.is_empty() {
            return Err(IdentityError::EmptyBundle);
        }
        Ok(Self { roots })
    }

    pub fn roots(&self) -> &[CertificateDer<'static>] {
        &self.roots
    }

    /// Build a rustls root store, skipping certificates rustls cannot use as
    /// trust anchors.
    pub fn root_store(&self) -> Result<RootCertStore, IdentityError> {
        let mut store = RootCertStore::empty();
        let (added, ignored) = store.add_parsable_certificates(self.roots.iter().cloned());
        if ignored > 0 {
            tracing::warn!(added, ignored, "Ignored unparsable certificates in trust bundle");
        }
        if added == 0 {
            return Err(IdentityError::EmptyBundle);
        }
        Ok(store)
    }
}

/// The SVID and trust bundle that are current at one point in time.
#[derive(Debug)]
pub struct WorkloadIdentity {
    svid: X509Svid,
    bundle: TrustBundle,
}

impl WorkloadIdentity {
    pub fn new(svid: X509Svid, bundle: TrustBundle) -> Self {
        Self { svid, bundle }
    }

    pub fn svid(&self) -> &X509Svid {
        &self.svid
    }

    pub fn bundle(&self) -> &TrustBundle {
        &self.bundle
    }

    /// Reject the identity once its SVID has expired.
    pub fn ensure_valid_at(&self, now: DateTime<Utc>) -> Result<(), IdentityError> {
        if self.svid.not_after <= now {
            return Err(IdentityError::Expired {
                id: self.svid.spiffe_id.clone(),
                not_after: self.svid.not_after,
            });
        }
        Ok(())
    }
}

/// Provides the workload's current identity.
///
/// Implementations must be safe to call concurrently with their own refresh
/// mechanism and must never block on it.
pub trait IdentitySource: Send + Sync {
    fn current(&self) -> Result<Arc<WorkloadIdentity>, IdentityError>;
}

/// An identity that never rotates.
#[derive(Debug, Clone)]
pub struct StaticIdentitySource {
    identity: Arc<WorkloadIdentity>,
}

impl StaticIdentitySource {
    pub fn new(identity: WorkloadIdentity) -> Self {
        Self { identity: Arc::new(identity) }
    }
}

impl IdentitySource for StaticIdentitySource {
    fn current(&self) -> Result<Arc<WorkloadIdentity>, IdentityError> {
        self.identity.ensure_valid_at(Utc::now())?;
        Ok(Arc::clone(&self.identity))
    }
}
