//! SPIFFE ID parsing and extraction from X.509 SVIDs.
//!
//! # SPIFFE URI Format
//!
//! ```text
//! spiffe://{trust_domain}/{path segment}/{path segment}...
//! ```
//!
//! The trust domain is lowercase letters, digits, `.`, `-` and `_`. Path
//! segments may also contain uppercase letters and must be neither empty nor
//! `.`/`..`. An X.509 SVID carries exactly one URI Subject Alternative Name,
//! and that URI is the workload's SPIFFE ID.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use x509_parser::prelude::*;

const SPIFFE_SCHEME_PREFIX: &str = "spiffe://";

/// Reasons a string or certificate did not yield a valid SPIFFE ID.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpiffeIdError {
    #[error("SPIFFE ID must start with 'spiffe://'")]
    WrongScheme,

    #[error("SPIFFE ID trust domain is empty")]
    EmptyTrustDomain,

    #[error("SPIFFE ID trust domain contains invalid character '{0}'")]
    InvalidTrustDomainChar(char),

    #[error("SPIFFE ID path contains an empty segment")]
    EmptySegment,

    #[error("SPIFFE ID path contains a '.' or '..' segment")]
    DotSegment,

    #[error("SPIFFE ID path contains invalid character '{0}'")]
    InvalidPathChar(char),

    #[error("certificate could not be parsed: {0}")]
    Certificate(String),

    #[error("certificate has no URI subject alternative name")]
    MissingUriSan,

    #[error("certificate has {0} URI subject alternative names, expected exactly one")]
    MultipleUriSans(usize),
}

/// A parsed SPIFFE ID: trust domain plus path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeId {
    trust_domain: String,
    path: String,
}

impl SpiffeId {
    /// Parse a `spiffe://` URI.
    pub fn parse(uri: &str) -> Result<Self, SpiffeIdError> {
        let rest = uri.strip_prefix(SPIFFE_SCHEME_PREFIX).ok_or(SpiffeIdError::WrongScheme)?;

        let (trust_domain, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };

        if trust_domain.is_empty() {
            return Err(SpiffeIdError::EmptyTrustDomain);
        }
        if let Some(c) = trust_domain.chars().find(|c| !is_trust_domain_char(*c)) {
            return Err(SpiffeIdError::InvalidTrustDomainChar(c));
        }

        if !path.is_empty() {
            for segment in path[1..].split('/') {
                if segment.is_empty() {
                    return Err(SpiffeIdError::EmptySegment);
                }
                if segment == "." || segment == ".." {
                    return Err(SpiffeIdError::DotSegment);
                }
                if let Some(c) = segment.chars().find(|c| !is_path_char(*c)) {
                    return Err(SpiffeIdError::InvalidPathChar(c));
                }
            }
        }

        Ok(Self { trust_domain: trust_domain.to_string(), path: path.to_string() })
    }

    /// Trust domain name, e.g. `flowplane.local`.
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Path component including its leading `/`, or empty.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", SPIFFE_SCHEME_PREFIX, self.trust_domain, self.path)
    }
}

impl FromStr for SpiffeId {
    type Err = SpiffeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn is_trust_domain_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_')
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')
}

/// Extract the SPIFFE ID from a DER-encoded leaf certificate.
pub fn spiffe_id_from_der(der: &[u8]) -> Result<SpiffeId, SpiffeIdError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| SpiffeIdError::Certificate(e.to_string()))?;
    spiffe_id_from_cert(&cert)
}

/// Extract the SPIFFE ID from a parsed certificate's URI SAN.
pub fn spiffe_id_from_cert(cert: &X509Certificate<'_>) -> Result<SpiffeId, SpiffeIdError> {
    let san = cert
        .subject_alternative_name()
        .map_err(|e| SpiffeIdError::Certificate(e.to_string()))?
        .ok_or(SpiffeIdError::MissingUriSan)?;

    let uris: Vec<&str> = san
        .value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::URI(uri) => Some(*uri),
            _ => None,
        })
        .collect();

    match uris.as_slice() {
        [] => Err(SpiffeIdError::MissingUriSan),
        [uri] => SpiffeId::parse(uri),
        many => Err(SpiffeIdError::MultipleUriSans(many.len())),
    }
}
