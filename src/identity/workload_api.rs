//! SPIFFE Workload API client.
//!
//! Opens the server-streaming `FetchX509SVID` RPC on the local agent socket
//! and publishes every update into a `watch` channel. Readers take the latest
//! value without waiting on the stream, so a rotation in progress never
//! blocks a fetch. When the stream ends or fails the task reconnects, backing
//! off with the same scheduler the sync loop uses.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hyper_util::rt::TokioIo;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info, warn};

use super::{IdentityError, IdentitySource, TrustBundle, WorkloadIdentity, X509Svid};
use crate::backoff::{BackoffPolicy, BackoffState};
use crate::utils::certificates::parse_der_chain;

/// Metadata header every Workload API request must carry.
const SECURITY_HEADER: &str = "workload.spiffe.io";
const FETCH_X509_SVID_PATH: &str = "/SpiffeWorkloadAPI/FetchX509SVID";

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Messages of the `SpiffeWorkloadAPI` service used by the sidecar.
pub mod proto {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct X509SvidRequest {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct X509SvidResponse {
        #[prost(message, repeated, tag = "1")]
        pub svids: Vec<X509Svid>,
        #[prost(bytes = "vec", repeated, tag = "2")]
        pub crl: Vec<Vec<u8>>,
        #[prost(map = "string, bytes", tag = "3")]
        pub federated_bundles: HashMap<String, Vec<u8>>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct X509Svid {
        #[prost(string, tag = "1")]
        pub spiffe_id: String,
        /// ASN.1 DER certificates, leaf first, concatenated.
        #[prost(bytes = "vec", tag = "2")]
        pub x509_svid: Vec<u8>,
        /// PKCS#8 DER private key.
        #[prost(bytes = "vec", tag = "3")]
        pub x509_svid_key: Vec<u8>,
        /// ASN.1 DER CA certificates, concatenated.
        #[prost(bytes = "vec", tag = "4")]
        pub bundle: Vec<u8>,
        #[prost(string, tag = "5")]
        pub hint: String,
    }
}

/// Where the Workload API listens, as given by `SPIFFE_ENDPOINT_SOCKET`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadApiAddress {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl WorkloadApiAddress {
    /// Accepts `unix:///path`, `unix:/path` and `tcp://ip:port`.
    pub fn parse(address: &str) -> Result<Self, IdentityError> {
        let invalid = || IdentityError::InvalidAddress(address.to_string());

        if let Some(path) = address.strip_prefix("unix://").or_else(|| address.strip_prefix("unix:")) {
            if !path.starts_with('/') || path.len() < 2 {
                return Err(invalid());
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        if let Some(addr) = address.strip_prefix("tcp://") {
            return addr.parse().map(Self::Tcp).map_err(|_| invalid());
        }

        Err(invalid())
    }
}

/// Identity source fed by the Workload API stream.
pub struct WorkloadApiSource {
    receiver: watch::Receiver<Option<Arc<WorkloadIdentity>>>,
    task: JoinHandle<()>,
}

impl WorkloadApiSource {
    /// Start watching the Workload API in a background task. The task stops
    /// when `shutdown` is cancelled or the source is dropped.
    pub fn spawn(address: WorkloadApiAddress, shutdown: CancellationToken) -> Self {
        let (sender, receiver) = watch::channel(None);
        let task = tokio::spawn(watch_x509_context(address, sender, shutdown));
        Self { receiver, task }
    }
}

impl Drop for WorkloadApiSource {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl IdentitySource for WorkloadApiSource {
    fn current(&self) -> Result<Arc<WorkloadIdentity>, IdentityError> {
        let identity = self.receiver.borrow().clone().ok_or(IdentityError::NotReady)?;
        identity.ensure_valid_at(Utc::now())?;
        Ok(identity)
    }
}

async fn watch_x509_context(
    address: WorkloadApiAddress,
    sender: watch::Sender<Option<Arc<WorkloadIdentity>>>,
    shutdown: CancellationToken,
) {
    let policy = BackoffPolicy::new(RECONNECT_INITIAL_DELAY, RECONNECT_MAX_DELAY, 2, 1, 1);
    let mut state = policy.initial_state();

    loop {
        let mut updates = 0u64;
        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = stream_x509_context(&address, &sender, &mut updates) => result,
        };

        match &result {
            Ok(()) => info!(updates, "Workload API stream closed by agent"),
            Err(e) => warn!(error = %e, updates, "Workload API stream failed"),
        }

        let (delay, next) = reconnect_delay(&policy, state, updates);
        state = next;

        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to Workload API");
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Wait before the next connection attempt. A stream that delivered
/// anything starts over at the initial delay; consecutive failures wait the
/// current interval and grow it for the next attempt.
fn reconnect_delay(
    policy: &BackoffPolicy,
    state: BackoffState,
    updates: u64,
) -> (Duration, BackoffState) {
    if updates > 0 {
        return (policy.initial_interval(), policy.initial_state());
    }
    let (_, next) = state.next(policy, false);
    (state.interval(), next)
}

async fn stream_x509_context(
    address: &WorkloadApiAddress,
    sender: &watch::Sender<Option<Arc<WorkloadIdentity>>>,
    updates: &mut u64,
) -> Result<(), IdentityError> {
    let channel = connect(address).await?;
    let mut client = tonic::client::Grpc::new(channel);
    client.ready().await.map_err(|e| IdentityError::Transport(e.to_string()))?;

    let mut request = tonic::Request::new(proto::X509SvidRequest {});
    request.metadata_mut().insert(SECURITY_HEADER, MetadataValue::from_static("true"));

    let codec =
        tonic_prost::ProstCodec::<proto::X509SvidRequest, proto::X509SvidResponse>::default();
    let path = http::uri::PathAndQuery::from_static(FETCH_X509_SVID_PATH);

    let mut stream = client
        .server_streaming(request, path, codec)
        .await
        .map_err(|status| IdentityError::Transport(status.to_string()))?
        .into_inner();

    while let Some(response) =
        stream.message().await.map_err(|status| IdentityError::Transport(status.to_string()))?
    {
        match identity_from_response(response) {
            Ok(identity) => {
                info!(
                    spiffe_id = %identity.svid().spiffe_id(),
                    expires_at = %identity.svid().not_after(),
                    "Received X.509 SVID update"
                );
                sender.send_replace(Some(Arc::new(identity)));
                *updates += 1;
            }
            Err(e) => warn!(error = %e, "Discarding malformed X.509 SVID update"),
        }
    }

    Ok(())
}

async fn connect(address: &WorkloadApiAddress) -> Result<Channel, IdentityError> {
    let transport_error = |e: tonic::transport::Error| IdentityError::Transport(e.to_string());

    match address {
        WorkloadApiAddress::Unix(path) => {
            let path = path.clone();
            // The URI is ignored by the connector; tonic only needs a valid authority.
            Endpoint::from_static("http://[::]:50051")
                .connect_with_connector(service_fn(move |_: Uri| {
                    let path = path.clone();
                    async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
                }))
                .await
                .map_err(transport_error)
        }
        WorkloadApiAddress::Tcp(addr) => Endpoint::from_shared(format!("http://{addr}"))
            .map_err(transport_error)?
            .connect()
            .await
            .map_err(transport_error),
    }
}

/// Convert a Workload API response into an identity. The first SVID is the
/// default identity; federated bundles are not used.
pub(crate) fn identity_from_response(
    response: proto::X509SvidResponse,
) -> Result<WorkloadIdentity, IdentityError> {
    let svid = response.svids.into_iter().next().ok_or(IdentityError::MissingSvid)?;

    let chain =
        parse_der_chain(&svid.x509_svid).map_err(|e| IdentityError::Certificate(e.to_string()))?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(svid.x509_svid_key));
    let x509 = X509Svid::new(chain, key)?;

    if !svid.spiffe_id.is_empty() && svid.spiffe_id != x509.spiffe_id().to_string() {
        return Err(IdentityError::Certificate(format!(
            "SVID certificate names {} but the response claims {}",
            x509.spiffe_id(),
            svid.spiffe_id
        )));
    }

    let roots =
        parse_der_chain(&svid.bundle).map_err(|e| IdentityError::Certificate(e.to_string()))?;

    Ok(WorkloadIdentity::new(x509, TrustBundle::new(roots)?))
}
