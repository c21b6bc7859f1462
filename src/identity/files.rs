//! File-backed identity source.
//!
//! Reads the SVID, key and bundle a SPIFFE helper keeps up to date on disk.
//! Files are re-read on every call so that a rotation written by the helper
//! is picked up by the very next fetch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::{IdentityError, IdentitySource, TrustBundle, WorkloadIdentity, X509Svid};
use crate::utils::certificates::load_svid_files;

/// Default file names written by spiffe-helper.
pub const SVID_FILE_NAME: &str = "svid.pem";
pub const SVID_KEY_FILE_NAME: &str = "svid_key.pem";
pub const SVID_BUNDLE_FILE_NAME: &str = "svid_bundle.pem";

#[derive(Debug, Clone)]
pub struct FileIdentitySource {
    cert_path: PathBuf,
    key_path: PathBuf,
    bundle_path: PathBuf,
}

impl FileIdentitySource {
    pub fn new(cert_path: PathBuf, key_path: PathBuf, bundle_path: PathBuf) -> Self {
        Self { cert_path, key_path, bundle_path }
    }

    /// Use the default spiffe-helper file names inside `dir`.
    pub fn from_dir(dir: &Path) -> Self {
        Self::new(
            dir.join(SVID_FILE_NAME),
            dir.join(SVID_KEY_FILE_NAME),
            dir.join(SVID_BUNDLE_FILE_NAME),
        )
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }
}

impl IdentitySource for FileIdentitySource {
    fn current(&self) -> Result<Arc<WorkloadIdentity>, IdentityError> {
        let loaded = load_svid_files(&self.cert_path, &self.key_path, &self.bundle_path)?;

        debug!(
            subject = %loaded.info.subject,
            issuer = %loaded.info.issuer,
            expires_at = %loaded.info.not_after,
            "Loaded SVID from files"
        );

        let svid = X509Svid::new(loaded.cert_chain, loaded.private_key)?;
        let bundle = TrustBundle::new(loaded.trust_roots)?;
        Ok(Arc::new(WorkloadIdentity::new(svid, bundle)))
    }
}
