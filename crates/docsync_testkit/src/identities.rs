//! TLS identity fixtures.

use docsync_tls::{CertificateAttributes, KeyUsage, TlsIdentity};

/// Generates an unstored listener identity with the given common name.
pub fn server_identity(common_name: &str) -> TlsIdentity {
    TlsIdentity::generate(KeyUsage::Server, &CertificateAttributes::new(common_name), None)
        .expect("Failed to generate server identity")
}

/// Generates an unstored replicator identity with the given common name.
pub fn client_identity(common_name: &str) -> TlsIdentity {
    TlsIdentity::generate(KeyUsage::Client, &CertificateAttributes::new(common_name), None)
        .expect("Failed to generate client identity")
}
