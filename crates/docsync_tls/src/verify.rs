//! Certificate verification for replicators (server side of the handshake)
//! and listeners (client certificates).
//!
//! Server trust is decided by [`ServerTrust`]:
//! - a pinned certificate must match the presented leaf byte-for-byte and
//!   chain validation is skipped entirely;
//! - self-signed-only mode accepts any unexpired self-signed leaf;
//! - otherwise the leaf must be, or be directly signed by, a trusted root.
//!
//! Handshake signatures are always checked with the ring provider's
//! algorithms, so a peer must actually hold the key for the certificate it
//! presents.

use crate::authenticator::CertificateValidator;
use crate::identity::is_self_signed;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    AlertDescription, CertificateError, DigitallySignedStruct, DistinguishedName, Error,
    SignatureScheme,
};
use std::fmt;
use std::io;
use std::sync::Arc;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// Holds the leaf certificate presented by the server of the most recent
/// handshake, captured before it is verified.
pub type PeerCertificateSlot = Arc<Mutex<Option<CertificateDer<'static>>>>;

/// Creates an empty peer certificate slot.
pub fn peer_certificate_slot() -> PeerCertificateSlot {
    Arc::new(Mutex::new(None))
}

/// How a replicator decides whether to trust a server certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerTrust {
    /// Only this exact certificate is accepted.
    Pinned(CertificateDer<'static>),
    /// Any unexpired self-signed certificate is accepted.
    SelfSignedOnly,
    /// The leaf must be one of these roots or directly signed by one.
    Roots(Vec<CertificateDer<'static>>),
}

impl ServerTrust {
    /// Builds the trust policy from replicator settings. A pin takes
    /// precedence over the self-signed flag.
    pub fn from_settings(
        pinned: Option<CertificateDer<'static>>,
        accept_only_self_signed: bool,
        roots: Vec<CertificateDer<'static>>,
    ) -> Self {
        match pinned {
            Some(pin) => Self::Pinned(pin),
            None if accept_only_self_signed => Self::SelfSignedOnly,
            None => Self::Roots(roots),
        }
    }
}

impl Default for ServerTrust {
    fn default() -> Self {
        Self::Roots(Vec::new())
    }
}

/// Why a TLS handshake failed, as far as replication error reporting cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsFailure {
    /// The server certificate does not chain to a trusted root or pin.
    UnknownRoot,
    /// The server certificate was found but is not acceptable (expired,
    /// not self-signed in self-signed-only mode, bad signature).
    Untrusted,
    /// The listener rejected our client certificate (or its absence).
    ClientCertRejected,
}

/// Classifies an I/O error returned by a TLS stream.
///
/// Returns None for errors that are not TLS verification failures.
pub fn classify_tls_error(error: &io::Error) -> Option<TlsFailure> {
    let tls = error.get_ref()?.downcast_ref::<Error>()?;
    classify_rustls_error(tls)
}

fn classify_rustls_error(error: &Error) -> Option<TlsFailure> {
    match error {
        Error::InvalidCertificate(CertificateError::UnknownIssuer) => Some(TlsFailure::UnknownRoot),
        Error::InvalidCertificate(_) => Some(TlsFailure::Untrusted),
        Error::AlertReceived(
            AlertDescription::BadCertificate
            | AlertDescription::CertificateRequired
            | AlertDescription::UnknownCA
            | AlertDescription::CertificateUnknown
            | AlertDescription::CertificateExpired
            | AlertDescription::CertificateRevoked
            | AlertDescription::UnsupportedCertificate
            | AlertDescription::AccessDenied,
        ) => Some(TlsFailure::ClientCertRejected),
        _ => None,
    }
}

fn algorithms() -> WebPkiSupportedAlgorithms {
    rustls::crypto::ring::default_provider().signature_verification_algorithms
}

/// Checks that `now` lies within the certificate's validity period.
fn check_validity(cert: &X509Certificate<'_>, now: UnixTime) -> Result<(), Error> {
    let now = i64::try_from(now.as_secs()).unwrap_or(i64::MAX);
    let validity = cert.validity();
    if now < validity.not_before.timestamp() {
        return Err(Error::InvalidCertificate(CertificateError::NotValidYet));
    }
    if now > validity.not_after.timestamp() {
        return Err(Error::InvalidCertificate(CertificateError::Expired));
    }
    Ok(())
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>, Error> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|_| Error::InvalidCertificate(CertificateError::BadEncoding))
}

/// Accepts `leaf` if it equals one of `roots` or is directly signed by one.
fn verify_against_roots(
    leaf: &CertificateDer<'_>,
    roots: &[CertificateDer<'static>],
    now: UnixTime,
) -> Result<(), Error> {
    let cert = parse(leaf)?;
    check_validity(&cert, now)?;
    for root in roots {
        if root.as_ref() == leaf.as_ref() {
            return Ok(());
        }
        let Ok((_, root_cert)) = X509Certificate::from_der(root) else {
            continue;
        };
        if root_cert.subject() == cert.issuer()
            && cert.verify_signature(Some(root_cert.public_key())).is_ok()
        {
            return Ok(());
        }
    }
    Err(Error::InvalidCertificate(CertificateError::UnknownIssuer))
}

// ============================================================================
// Server certificate verification (replicator side)
// ============================================================================

/// Verifies server certificates according to a [`ServerTrust`] policy.
pub struct ServerVerifier {
    trust: ServerTrust,
    seen: PeerCertificateSlot,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerVerifier {
    /// Creates a verifier that records each presented leaf into `seen`.
    pub fn new(trust: ServerTrust, seen: PeerCertificateSlot) -> Self {
        Self {
            trust,
            seen,
            algorithms: algorithms(),
        }
    }
}

impl fmt::Debug for ServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match &self.trust {
            ServerTrust::Pinned(_) => "pinned",
            ServerTrust::SelfSignedOnly => "self-signed-only",
            ServerTrust::Roots(_) => "roots",
        };
        f.debug_struct("ServerVerifier").field("mode", &mode).finish()
    }
}

impl ServerCertVerifier for ServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        *self.seen.lock() = Some(end_entity.clone().into_owned());

        let result = match &self.trust {
            ServerTrust::Pinned(pin) => {
                if pin.as_ref() == end_entity.as_ref() {
                    Ok(())
                } else {
                    Err(Error::InvalidCertificate(CertificateError::UnknownIssuer))
                }
            }
            ServerTrust::SelfSignedOnly => {
                let cert = parse(end_entity)?;
                check_validity(&cert, now)?;
                if is_self_signed(end_entity) {
                    Ok(())
                } else {
                    Err(Error::InvalidCertificate(
                        CertificateError::ApplicationVerificationFailure,
                    ))
                }
            }
            ServerTrust::Roots(roots) => verify_against_roots(end_entity, roots, now),
        };

        match result {
            Ok(()) => Ok(ServerCertVerified::assertion()),
            Err(e) => {
                tracing::debug!(error = %e, "server certificate rejected");
                Err(e)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

// ============================================================================
// Client certificate verification (listener side)
// ============================================================================

/// Verifies client certificates with a [`CertificateValidator`]. Client
/// authentication is mandatory when this verifier is installed.
pub struct ClientVerifier {
    validator: CertificateValidator,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientVerifier {
    /// Creates a verifier for the given validator.
    pub fn new(validator: CertificateValidator) -> Self {
        Self {
            validator,
            algorithms: algorithms(),
        }
    }
}

impl fmt::Debug for ClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientVerifier")
            .field("validator", &self.validator)
            .finish()
    }
}

impl ClientCertVerifier for ClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, Error> {
        let accepted = match &self.validator {
            CertificateValidator::Callback(check) => {
                let chain: Vec<CertificateDer<'static>> = std::iter::once(end_entity)
                    .chain(intermediates)
                    .map(|c| c.clone().into_owned())
                    .collect();
                check(&chain)
            }
            CertificateValidator::RootCertificates(roots) => {
                verify_against_roots(end_entity, roots, now).is_ok()
            }
        };

        if accepted {
            Ok(ClientCertVerified::assertion())
        } else {
            tracing::debug!("client certificate rejected");
            Err(Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{CertificateAttributes, KeyUsage, TlsIdentity};

    fn identity(cn: &str) -> TlsIdentity {
        TlsIdentity::generate(KeyUsage::Server, &CertificateAttributes::new(cn), None).unwrap()
    }

    fn verify(trust: ServerTrust, leaf: &CertificateDer<'static>) -> Result<(), Error> {
        let slot = peer_certificate_slot();
        let verifier = ServerVerifier::new(trust, slot.clone());
        let name = ServerName::try_from("localhost").unwrap();
        let result = verifier
            .verify_server_cert(leaf, &[], &name, &[], UnixTime::now())
            .map(|_| ());
        assert_eq!(slot.lock().as_ref(), Some(leaf));
        result
    }

    #[test]
    fn pin_must_match_exactly() {
        let a = identity("a");
        let b = identity("b");
        assert!(verify(ServerTrust::Pinned(a.leaf().clone()), a.leaf()).is_ok());
        let err = verify(ServerTrust::Pinned(b.leaf().clone()), a.leaf()).unwrap_err();
        assert_eq!(classify_rustls_error(&err), Some(TlsFailure::UnknownRoot));
    }

    #[test]
    fn pin_wins_over_self_signed_flag() {
        let a = identity("a");
        let b = identity("b");
        let trust = ServerTrust::from_settings(Some(b.leaf().clone()), true, Vec::new());
        assert!(matches!(trust, ServerTrust::Pinned(_)));
        assert!(verify(trust, a.leaf()).is_err());
    }

    #[test]
    fn self_signed_only_accepts_self_signed() {
        let a = identity("a");
        assert!(verify(ServerTrust::SelfSignedOnly, a.leaf()).is_ok());
    }

    #[test]
    fn default_roots_reject_self_signed() {
        let a = identity("a");
        let err = verify(ServerTrust::default(), a.leaf()).unwrap_err();
        assert_eq!(classify_rustls_error(&err), Some(TlsFailure::UnknownRoot));
        // Explicitly trusted as a root, the same certificate passes.
        assert!(verify(ServerTrust::Roots(vec![a.leaf().clone()]), a.leaf()).is_ok());
    }

    #[test]
    fn client_verifier_callback_sees_chain() {
        let a = identity("client");
        let expected = a.leaf().clone();
        let verifier = ClientVerifier::new(CertificateValidator::Callback(Arc::new(
            move |chain: &[CertificateDer<'static>]| chain.first() == Some(&expected),
        )));
        assert!(verifier
            .verify_client_cert(a.leaf(), &[], UnixTime::now())
            .is_ok());

        let other = identity("intruder");
        let err = verifier
            .verify_client_cert(other.leaf(), &[], UnixTime::now())
            .unwrap_err();
        assert_eq!(classify_rustls_error(&err), Some(TlsFailure::Untrusted));
    }

    #[test]
    fn client_verifier_roots() {
        let trusted = identity("trusted");
        let verifier = ClientVerifier::new(CertificateValidator::RootCertificates(vec![trusted
            .leaf()
            .clone()]));
        assert!(verifier
            .verify_client_cert(trusted.leaf(), &[], UnixTime::now())
            .is_ok());
        assert!(verifier
            .verify_client_cert(identity("other").leaf(), &[], UnixTime::now())
            .is_err());
        assert!(verifier.client_auth_mandatory());
    }

    #[test]
    fn classify_alerts_and_plain_io() {
        let alert = io::Error::new(
            io::ErrorKind::InvalidData,
            Error::AlertReceived(AlertDescription::CertificateRequired),
        );
        assert_eq!(
            classify_tls_error(&alert),
            Some(TlsFailure::ClientCertRejected)
        );
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(classify_tls_error(&refused), None);
    }
}
