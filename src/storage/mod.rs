//! # Secret Persistence
//!
//! The fetched secret is handed to the workload through a file. Readers of
//! that file must only ever see a complete secret, old or new, so the file
//! store writes a temporary sibling, syncs it and renames it over the
//! destination.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::fetch::SecretPayload;

/// Owner read/write only; the file holds credentials.
#[cfg(unix)]
pub const SECRET_FILE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("destination path '{0}' has no file name")]
    InvalidPath(PathBuf),

    #[error("failed to create directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write temporary file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to move '{from}' into place: {source}")]
    Rename {
        from: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Durable destination for fetched secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Replace whatever was stored before with `payload`.
    async fn save(&self, payload: &SecretPayload) -> Result<(), StoreError>;
}

/// Stores the secret verbatim in a single file.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> Result<PathBuf, StoreError> {
        let name = self
            .path
            .file_name()
            .ok_or_else(|| StoreError::InvalidPath(self.path.clone()))?
            .to_string_lossy();
        Ok(self.path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple())))
    }

    async fn write_temp(temp: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(SECRET_FILE_MODE);

        let mut file = options.open(temp).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn save(&self, payload: &SecretPayload) -> Result<(), StoreError> {
        let temp = self.temp_path()?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::CreateDir { path: parent.to_path_buf(), source })?;
        }

        if let Err(source) = Self::write_temp(&temp, payload.as_str().as_bytes()).await {
            let _ = fs::remove_file(&temp).await;
            return Err(StoreError::Write { path: temp, source });
        }

        if let Err(source) = fs::rename(&temp, &self.path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(StoreError::Rename { from: temp, source });
        }

        #[cfg(unix)]
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            // The rename is only durable once the directory entry is.
            let synced = match fs::File::open(parent).await {
                Ok(dir) => dir.sync_all().await,
                Err(e) => Err(e),
            };
            if let Err(e) = synced {
                warn!(path = %parent.display(), error = %e, "Failed to sync secrets directory");
            }
        }

        debug!(path = %self.path.display(), bytes = payload.len(), "Secret written");
        Ok(())
    }
}
