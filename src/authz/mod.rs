//! # Peer Authorization
//!
//! Two allow-lists decide who may talk to whom. The workload list answers
//! "is this workload entitled to fetch a secret at all" and is checked
//! against our own SVID before any connection is made. The server list
//! answers "is the remote end the secrets authority" and is checked inside
//! the TLS handshake by [`SpiffeServerVerifier`].
//!
//! Both lists are [`IdentityPredicate`]s so deployments can plug in any
//! policy; [`PrefixAllowList`] covers the common case of matching ID
//! prefixes.

pub mod verifier;

use std::fmt;
use std::sync::Arc;

use crate::identity::SpiffeId;

pub use verifier::{PeerRejection, SpiffeServerVerifier};

/// A yes/no decision about a SPIFFE ID. Implementations must be stateless
/// from the caller's point of view and cheap enough to run per handshake.
pub trait IdentityPredicate: Send + Sync {
    fn matches(&self, id: &SpiffeId) -> bool;
}

impl<F> IdentityPredicate for F
where
    F: Fn(&SpiffeId) -> bool + Send + Sync,
{
    fn matches(&self, id: &SpiffeId) -> bool {
        self(id)
    }
}

/// Accepts IDs whose URI form starts with one of the configured prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixAllowList {
    prefixes: Vec<String>,
}

impl PrefixAllowList {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|prefix: &String| !prefix.is_empty())
                .collect(),
        }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}

impl IdentityPredicate for PrefixAllowList {
    fn matches(&self, id: &SpiffeId) -> bool {
        let uri = id.to_string();
        self.prefixes.iter().any(|prefix| uri.starts_with(prefix.as_str()))
    }
}

/// The pair of predicates the fetcher consults.
#[derive(Clone)]
pub struct AllowLists {
    workload: Arc<dyn IdentityPredicate>,
    server: Arc<dyn IdentityPredicate>,
}

impl AllowLists {
    pub fn new(
        workload: impl IdentityPredicate + 'static,
        server: impl IdentityPredicate + 'static,
    ) -> Self {
        Self { workload: Arc::new(workload), server: Arc::new(server) }
    }

    /// Whether our own identity may ask for a secret.
    pub fn is_entitled_workload(&self, id: &SpiffeId) -> bool {
        self.workload.matches(id)
    }

    /// Whether a presented server identity is the secrets authority.
    pub fn is_trusted_server(&self, id: &SpiffeId) -> bool {
        self.server.matches(id)
    }
}

impl fmt::Debug for AllowLists {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllowLists").finish_non_exhaustive()
    }
}
