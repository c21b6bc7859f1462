//! Ephemeral SPIFFE PKI for unit tests.

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa,
    KeyPair, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use super::{TrustBundle, WorkloadIdentity, X509Svid};

pub(crate) struct TestPki {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
}

pub(crate) struct IssuedSvid {
    pub cert: CertificateDer<'static>,
    pub key_der: Vec<u8>,
}

impl TestPki {
    pub(crate) fn new() -> Self {
        let ca_key = KeyPair::generate().expect("generate CA key");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, "Flowplane Test CA");
        let ca_cert = params.self_signed(&ca_key).expect("self-sign CA");
        Self { ca_cert, ca_key }
    }

    pub(crate) fn ca_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    pub(crate) fn issue(&self, spiffe_id: &str) -> IssuedSvid {
        let key = KeyPair::generate().expect("generate SVID key");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("SVID params");
        params.distinguished_name.push(DnType::CommonName, "svid");
        params
            .subject_alt_names
            .push(SanType::URI(Ia5String::try_from(spiffe_id).expect("ia5 spiffe id")));
        params.extended_key_usages =
            vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).expect("sign SVID");
        IssuedSvid { cert: cert.der().clone(), key_der: key.serialize_der() }
    }

    pub(crate) fn identity(&self, spiffe_id: &str) -> WorkloadIdentity {
        let issued = self.issue(spiffe_id);
        let svid = X509Svid::new(
            vec![issued.cert],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(issued.key_der)),
        )
        .expect("valid SVID");
        WorkloadIdentity::new(svid, TrustBundle::new(vec![self.ca_der()]).expect("bundle"))
    }
}
