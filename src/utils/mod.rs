//! Utility functions and helpers

pub mod certificates;

pub use certificates::{load_svid_files, parse_der_chain, CertificateInfo, SvidFileBundle};
