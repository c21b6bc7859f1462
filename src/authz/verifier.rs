//! rustls server certificate verifier for SPIFFE peers.
//!
//! The authority is addressed by URL but identified by its SVID, so the DNS
//! name in the URL is ignored. A server is accepted when its chain verifies
//! against our trust bundle and the SPIFFE ID in its leaf is on the server
//! allow-list. Anything else fails the handshake before application data is
//! exchanged, and the reason is kept for the caller to classify.

use std::fmt;
use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;
use tracing::warn;

use super::AllowLists;
use crate::identity::{spiffe_id_from_der, SpiffeId};

/// Why a server was refused during the handshake.
#[derive(Debug, Clone, Error)]
pub enum PeerRejection {
    #[error("server certificate chain is not trusted: {0}")]
    UntrustedChain(String),

    #[error("server certificate has no usable SPIFFE ID: {0}")]
    MissingSpiffeId(String),

    #[error("server identity '{0}' is not an allowed secrets authority")]
    NotAllowed(SpiffeId),
}

pub struct SpiffeServerVerifier {
    roots: Arc<RootCertStore>,
    allow_lists: AllowLists,
    provider: Arc<CryptoProvider>,
    rejection: Mutex<Option<PeerRejection>>,
}

impl SpiffeServerVerifier {
    pub fn new(
        roots: Arc<RootCertStore>,
        allow_lists: AllowLists,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self { roots, allow_lists, provider, rejection: Mutex::new(None) }
    }

    /// The reason the most recent handshake was refused, if any.
    pub fn take_rejection(&self) -> Option<PeerRejection> {
        self.rejection.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
    }

    fn reject(&self, rejection: PeerRejection) -> rustls::Error {
        warn!(reason = %rejection, "Rejected secrets authority during TLS handshake");
        *self.rejection.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(rejection);
        rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
    }
}

impl fmt::Debug for SpiffeServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiffeServerVerifier")
            .field("roots", &self.roots.len())
            .finish_non_exhaustive()
    }
}

impl ServerCertVerifier for SpiffeServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let parsed = ParsedCertificate::try_from(end_entity)
            .map_err(|e| self.reject(PeerRejection::UntrustedChain(e.to_string())))?;

        verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )
        .map_err(|e| self.reject(PeerRejection::UntrustedChain(e.to_string())))?;

        let id = spiffe_id_from_der(end_entity.as_ref())
            .map_err(|e| self.reject(PeerRejection::MissingSpiffeId(e.to_string())))?;

        if !self.allow_lists.is_trusted_server(&id) {
            return Err(self.reject(PeerRejection::NotAllowed(id)));
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
