//! rustls configuration builders for listeners and replicators.

use crate::authenticator::CertificateValidator;
use crate::error::TlsResult;
use crate::identity::TlsIdentity;
use crate::verify::{ClientVerifier, PeerCertificateSlot, ServerTrust, ServerVerifier};
use rustls::{ClientConfig, ServerConfig};
use std::sync::Arc;

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Builds a listener's server config.
///
/// With a validator, clients must present a certificate that it accepts.
pub fn server_config(
    identity: &TlsIdentity,
    client_validator: Option<CertificateValidator>,
) -> TlsResult<Arc<ServerConfig>> {
    let builder = ServerConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
    let builder = match client_validator {
        Some(validator) => builder.with_client_cert_verifier(Arc::new(ClientVerifier::new(validator))),
        None => builder.with_no_client_auth(),
    };
    let config = builder.with_single_cert(identity.certificates().to_vec(), identity.private_key()?)?;
    Ok(Arc::new(config))
}

/// Builds a replicator's client config.
///
/// The presented server leaf is recorded into `seen` whether or not it is
/// trusted.
pub fn client_config(
    trust: ServerTrust,
    client_identity: Option<&TlsIdentity>,
    seen: PeerCertificateSlot,
) -> TlsResult<Arc<ClientConfig>> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(ServerVerifier::new(trust, seen)));
    let config = match client_identity {
        Some(identity) => builder
            .with_client_auth_cert(identity.certificates().to_vec(), identity.private_key()?)?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}
