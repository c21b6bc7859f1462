//! # Command Line Interface
//!
//! Environment variables carry the full configuration; the flags here only
//! override the values most often changed by hand.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::SidecarConfig;

pub const EXIT_OK: i32 = 0;
/// The workload's own SPIFFE ID is not on the workload allow-list.
pub const EXIT_NOT_ENTITLED: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "flowplane-sidecar")]
#[command(about = "Keeps a workload secret file in sync with the Flowplane secrets authority")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Base URL of the secrets authority
    #[arg(long, global = true)]
    pub authority_url: Option<String>,

    /// File the secret is written to
    #[arg(long, global = true)]
    pub secrets_path: Option<PathBuf>,

    /// Enable debug logging for the sidecar
    #[arg(short, long, global = true, env = "FLOWPLANE_SIDECAR_VERBOSE")]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Poll the authority and keep the secret file current
    Watch,

    /// Wait until a non-empty secret exists, then exit 0 (init container)
    Init,
}

impl Cli {
    /// Apply flag overrides on top of the environment configuration.
    pub fn apply_overrides(&self, config: &mut SidecarConfig) {
        if let Some(url) = &self.authority_url {
            config.authority.url = url.clone();
        }
        if let Some(path) = &self.secrets_path {
            config.output.secrets_path = path.clone();
        }
    }

    pub fn mode(&self) -> &'static str {
        match self.command {
            Command::Watch => "watch",
            Command::Init => "init",
        }
    }
}
