use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    serve::Listener,
    Router,
};
use flowplane_sidecar::{
    authz::{AllowLists, PrefixAllowList},
    fetch::{AuthorizedFetcher, FetchMethod, SECRETS_API_PATH},
    identity::{FileIdentitySource, IdentitySource, StaticIdentitySource, TrustBundle, WorkloadIdentity, X509Svid},
};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa,
    KeyPair, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use url::Url;

pub const WORKLOAD_ID: &str = "spiffe://flowplane.local/ns/payments/sa/api";
pub const AUTHORITY_ID: &str = "spiffe://flowplane.local/ns/flowplane-system/sa/secrets-authority";
pub const WORKLOAD_PREFIX: &str = "spiffe://flowplane.local/ns/payments/";
pub const AUTHORITY_PREFIX: &str = "spiffe://flowplane.local/ns/flowplane-system/";

/// An SVID issued by a [`TestCa`].
pub struct IssuedCert {
    pub cert: CertificateDer<'static>,
    pub cert_pem: String,
    pub key: KeyPair,
}

impl IssuedCert {
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.serialize_der()))
    }
}

/// Throwaway SPIFFE certificate authority.
pub struct TestCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let key = KeyPair::generate().expect("generate CA key");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, name);
        params.distinguished_name.push(DnType::OrganizationName, "Flowplane");
        let cert = params.self_signed(&key).expect("self-sign CA");
        Self { cert, key }
    }

    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    pub fn issue(&self, spiffe_id: &str) -> IssuedCert {
        let key = KeyPair::generate().expect("generate SVID key");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("SVID params");
        params.distinguished_name.push(DnType::CommonName, "Flowplane Test SVID");
        params
            .subject_alt_names
            .push(SanType::URI(Ia5String::try_from(spiffe_id).expect("ia5 spiffe id")));
        params.extended_key_usages =
            vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
        let cert = params.signed_by(&key, &self.cert, &self.key).expect("sign SVID");

        IssuedCert { cert: cert.der().clone(), cert_pem: cert.pem(), key }
    }

    pub fn workload_identity(&self, spiffe_id: &str) -> WorkloadIdentity {
        let issued = self.issue(spiffe_id);
        let svid = X509Svid::new(vec![issued.cert.clone()], issued.private_key()).expect("valid SVID");
        let bundle = TrustBundle::new(vec![self.der()]).expect("trust bundle");
        WorkloadIdentity::new(svid, bundle)
    }

    pub fn static_source(&self, spiffe_id: &str) -> Arc<dyn IdentitySource> {
        Arc::new(StaticIdentitySource::new(self.workload_identity(spiffe_id)))
    }

    /// Write the SVID, key and bundle the way spiffe-helper lays them out.
    pub fn write_svid_files(&self, spiffe_id: &str) -> SvidDir {
        let issued = self.issue(spiffe_id);
        let dir = TempDir::new().expect("create svid dir");
        std::fs::write(dir.path().join("svid.pem"), &issued.cert_pem).expect("write svid");
        std::fs::write(dir.path().join("svid_key.pem"), issued.key.serialize_pem()).expect("write key");
        std::fs::write(dir.path().join("svid_bundle.pem"), self.pem()).expect("write bundle");
        SvidDir { dir }
    }
}

pub struct SvidDir {
    dir: TempDir,
}

impl SvidDir {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn source(&self) -> Arc<dyn IdentitySource> {
        Arc::new(FileIdentitySource::from_dir(self.path()))
    }
}

/// What the mock authority answers on the secrets path.
#[derive(Clone)]
pub enum Reply {
    Json(serde_json::Value),
    Status(StatusCode),
    Raw(&'static str),
    /// 307 back to the secrets path.
    Redirect,
}

struct AuthorityState {
    reply: Reply,
    methods: Mutex<Vec<Method>>,
}

/// HTTPS secrets authority that requires a client certificate from `client_ca`.
pub struct MockAuthority {
    addr: SocketAddr,
    state: Arc<AuthorityState>,
    task: JoinHandle<()>,
}

impl MockAuthority {
    pub async fn spawn(server_ca: &TestCa, server_id: &str, client_ca: &TestCa, reply: Reply) -> Self {
        let acceptor = server_acceptor(server_ca.issue(server_id), client_ca.der());
        let state = Arc::new(AuthorityState { reply, methods: Mutex::new(Vec::new()) });

        let router = Router::new()
            .route(SECRETS_API_PATH, get(answer).post(answer))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind authority");
        let addr = listener.local_addr().expect("authority address");
        let task = tokio::spawn(async move {
            let _ = axum::serve(TlsListener { listener, acceptor }, router).await;
        });

        Self { addr, state, task }
    }

    pub fn base_url(&self) -> Url {
        Url::parse(&format!("https://{}", self.addr)).expect("authority url")
    }

    pub fn methods(&self) -> Vec<Method> {
        self.state.methods.lock().expect("methods lock").clone()
    }

    pub fn fetcher(&self, identity: Arc<dyn IdentitySource>) -> AuthorizedFetcher {
        let endpoint = flowplane_sidecar::fetch::secrets_endpoint(&self.base_url()).expect("endpoint");
        AuthorizedFetcher::new(identity, default_allow_lists(), endpoint).with_method(FetchMethod::Get)
    }
}

impl Drop for MockAuthority {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn default_allow_lists() -> AllowLists {
    AllowLists::new(PrefixAllowList::new([WORKLOAD_PREFIX]), PrefixAllowList::new([AUTHORITY_PREFIX]))
}

async fn answer(State(state): State<Arc<AuthorityState>>, method: Method) -> Response {
    state.methods.lock().expect("methods lock").push(method);

    match &state.reply {
        Reply::Json(body) => axum::Json(body.clone()).into_response(),
        Reply::Status(status) => (*status).into_response(),
        Reply::Raw(body) => (StatusCode::OK, *body).into_response(),
        Reply::Redirect => axum::response::Redirect::temporary(SECRETS_API_PATH).into_response(),
    }
}

fn server_acceptor(issued: IssuedCert, client_ca: CertificateDer<'static>) -> TlsAcceptor {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    roots.add(client_ca).expect("add client CA");
    let client_verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .build()
        .expect("client verifier");

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(vec![issued.cert.clone()], issued.private_key())
        .expect("server certificate");

    TlsAcceptor::from(Arc::new(config))
}

struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            // Failed handshakes are expected in the rejection tests.
            if let Ok((stream, addr)) = self.listener.accept().await {
                if let Ok(tls_stream) = self.acceptor.accept(stream).await {
                    return (tls_stream, addr);
                }
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.listener.local_addr()
    }
}

pub fn secrets_file(dir: &TempDir) -> PathBuf {
    dir.path().join("run").join("secrets.json")
}
