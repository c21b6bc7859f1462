use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};
use ring::{
    rand::SystemRandom,
    signature::{
        EcdsaKeyPair, Ed25519KeyPair, KeyPair, RsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING,
        ECDSA_P384_SHA384_ASN1_SIGNING,
    },
};
use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};
use x509_parser::prelude::*;

use crate::errors::TlsError;

const OID_ED25519: &str = "1.3.101.112";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";

/// Metadata extracted from the SVID leaf certificate for logging and validation.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// SVID material loaded from the PEM files a SPIFFE helper writes to disk.
#[derive(Debug)]
pub struct SvidFileBundle {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub bundle_path: PathBuf,
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    pub trust_roots: Vec<CertificateDer<'static>>,
    pub info: CertificateInfo,
}

/// Load and validate an SVID, its key and the trust bundle from disk.
pub fn load_svid_files(
    cert_path: &Path,
    key_path: &Path,
    bundle_path: &Path,
) -> Result<SvidFileBundle, TlsError> {
    let cert_bytes = fs::read(cert_path)
        .map_err(|e| TlsError::CertificateReadError { path: cert_path.to_path_buf(), source: e })?;
    let cert_chain = parse_pem_certificates(&cert_bytes, cert_path)?;

    let bundle_bytes = fs::read(bundle_path)
        .map_err(|e| TlsError::BundleReadError { path: bundle_path.to_path_buf(), source: e })?;
    let trust_roots = parse_pem_certificates(&bundle_bytes, bundle_path)?;

    let key_bytes = fs::read(key_path)
        .map_err(|e| TlsError::PrivateKeyReadError { path: key_path.to_path_buf(), source: e })?;
    let private_key = PrivateKeyDer::from_pem_slice(&key_bytes).map_err(|err| {
        TlsError::InvalidPrivateKey { path: key_path.to_path_buf(), source: Some(anyhow!(err)) }
    })?;

    let leaf = &cert_chain[0];
    let (_, parsed) = X509Certificate::from_der(leaf.as_ref()).map_err(|err| {
        TlsError::CertificateMetadata { path: cert_path.to_path_buf(), source: anyhow!(err) }
    })?;

    let info = certificate_info(&parsed, cert_path)?;
    validate_certificate_dates(&info, cert_path)?;
    enforce_public_key_match(&parsed, &private_key, key_path)?;

    Ok(SvidFileBundle {
        cert_path: cert_path.to_path_buf(),
        key_path: key_path.to_path_buf(),
        bundle_path: bundle_path.to_path_buf(),
        cert_chain,
        private_key,
        trust_roots,
        info,
    })
}

fn parse_pem_certificates(
    bytes: &[u8],
    path: &Path,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(bytes)
        .map(|result| {
            result.map_err(|err| TlsError::InvalidCertificatePem {
                path: path.to_path_buf(),
                source: anyhow!(err),
            })
        })
        .collect::<Result<_, _>>()?;

    if certs.is_empty() {
        return Err(TlsError::EmptyCertificateChain { path: path.to_path_buf() });
    }

    Ok(certs)
}

/// Split a buffer of concatenated DER certificates, as delivered by the
/// SPIFFE Workload API, into individual certificates.
pub fn parse_der_chain(bytes: &[u8]) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut certs = Vec::new();
    let mut rest = bytes;

    while !rest.is_empty() {
        let (remaining, _) = X509Certificate::from_der(rest)
            .map_err(|err| anyhow!("invalid DER certificate at offset {}: {err}", bytes.len() - rest.len()))?;
        let consumed = rest.len() - remaining.len();
        certs.push(CertificateDer::from(rest[..consumed].to_vec()));
        rest = remaining;
    }

    if certs.is_empty() {
        return Err(anyhow!("no certificates present"));
    }

    Ok(certs)
}

/// Read the validity window of a certificate.
pub fn certificate_info(cert: &X509Certificate<'_>, path: &Path) -> Result<CertificateInfo, TlsError> {
    let validity = cert.validity();
    let not_before = asn1_time_to_chrono(validity.not_before.timestamp(), path)?;
    let not_after = asn1_time_to_chrono(validity.not_after.timestamp(), path)?;

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before,
        not_after,
    })
}

fn asn1_time_to_chrono(timestamp: i64, path: &Path) -> Result<DateTime<Utc>, TlsError> {
    Utc.timestamp_opt(timestamp, 0).single().ok_or_else(|| TlsError::CertificateMetadata {
        path: path.to_path_buf(),
        source: anyhow!("failed to convert certificate time"),
    })
}

fn validate_certificate_dates(info: &CertificateInfo, path: &Path) -> Result<(), TlsError> {
    let now = Utc::now();
    if info.not_before > now {
        return Err(TlsError::CertificateNotYetValid {
            path: path.to_path_buf(),
            not_before: info.not_before,
        });
    }
    if info.not_after <= now {
        return Err(TlsError::CertificateExpired {
            path: path.to_path_buf(),
            not_after: info.not_after,
        });
    }
    Ok(())
}

/// Check that the private key belongs to the certificate's public key.
///
/// ring exposes Ed25519 and ECDSA public keys as raw points and RSA public
/// keys as a DER `RSAPublicKey`, which is exactly the content of the
/// certificate's `subjectPublicKey` bit string in each case.
fn enforce_public_key_match(
    cert: &X509Certificate<'_>,
    private_key: &PrivateKeyDer<'static>,
    key_path: &Path,
) -> Result<(), TlsError> {
    let spki = cert.public_key();
    let algorithm_oid = spki.algorithm.algorithm.to_id_string();
    let public_key: &[u8] = &spki.subject_public_key.data;
    let key_bytes = private_key.secret_der();

    match algorithm_oid.as_str() {
        OID_ED25519 => {
            let key_pair = Ed25519KeyPair::from_pkcs8_maybe_unchecked(key_bytes)
                .map_err(|_| TlsError::CertificateKeyMismatch)?;
            compare_bytes(key_pair.public_key().as_ref(), public_key)
        }
        OID_EC_PUBLIC_KEY => {
            let rng = SystemRandom::new();
            if let Ok(key_pair) =
                EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, key_bytes, &rng)
            {
                return compare_bytes(key_pair.public_key().as_ref(), public_key);
            }

            if let Ok(key_pair) =
                EcdsaKeyPair::from_pkcs8(&ECDSA_P384_SHA384_ASN1_SIGNING, key_bytes, &rng)
            {
                return compare_bytes(key_pair.public_key().as_ref(), public_key);
            }

            Err(TlsError::CertificateKeyMismatch)
        }
        OID_RSA_ENCRYPTION => {
            if let Ok(key_pair) = RsaKeyPair::from_pkcs8(key_bytes) {
                return compare_bytes(key_pair.public().as_ref(), public_key);
            }
            if let Ok(key_pair) = RsaKeyPair::from_der(key_bytes) {
                return compare_bytes(key_pair.public().as_ref(), public_key);
            }
            Err(TlsError::InvalidPrivateKey { path: key_path.to_path_buf(), source: None })
        }
        _ => Ok(()),
    }
}

fn compare_bytes(expected: &[u8], actual: &[u8]) -> Result<(), TlsError> {
    if expected == actual {
        Ok(())
    } else {
        Err(TlsError::CertificateKeyMismatch)
    }
}
