//! # Flowplane Sidecar
//!
//! A workload sidecar that keeps a local secret file in sync with the
//! Flowplane secrets authority. Every request is made over mutual TLS using
//! the workload's SPIFFE X.509-SVID, and both ends of the connection are
//! checked against SPIFFE ID allow-lists.
//!
//! ## Architecture
//!
//! ```text
//! Workload API / SVID files → IdentitySource → AuthorizedFetcher → SyncLoop → FileSecretStore
//!                                                   ↓                  ↓
//!                                              AllowLists         BackoffPolicy
//! ```
//!
//! ## Core Components
//!
//! - **Identity**: the workload's current SVID and trust bundle
//! - **Authz**: SPIFFE ID allow-lists and the server certificate verifier
//! - **Fetch**: one mTLS request to the authority per cycle, classified into a [`fetch::FetchOutcome`]
//! - **Sync**: the adaptive polling loop (`watch`) and the init-container probe (`init`)
//! - **Storage**: atomic replacement of the secret file
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use flowplane_sidecar::{config::SidecarConfig, observability::MetricsRecorder, startup::Sidecar, Result};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = SidecarConfig::from_env()?;
//!     config.validate()?;
//!
//!     let shutdown = CancellationToken::new();
//!     let sidecar = Sidecar::new(config, MetricsRecorder::new(), &shutdown)?;
//!     sidecar.watch(shutdown).await?;
//!     Ok(())
//! }
//! ```

pub mod authz;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod errors;
pub mod fetch;
pub mod identity;
pub mod observability;
pub mod startup;
pub mod storage;
pub mod sync;
pub mod utils;

// Re-export commonly used types and traits
pub use authz::AllowLists;
pub use backoff::{BackoffPolicy, BackoffState};
pub use config::SidecarConfig;
pub use errors::{Error, Result};
pub use fetch::{FetchOutcome, SecretFetcher, SecretPayload};
pub use identity::{IdentitySource, SpiffeId};
pub use storage::{FileSecretStore, SecretStore};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
