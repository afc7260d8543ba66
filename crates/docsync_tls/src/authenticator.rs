//! Credentials presented by replicators and checks applied by listeners.

use crate::identity::TlsIdentity;
use rustls::pki_types::CertificateDer;
use std::fmt;
use std::sync::Arc;

/// Callback deciding whether a username/password pair is accepted.
pub type PasswordCallback = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Callback deciding whether a client certificate chain (leaf first) is accepted.
pub type CertificateCallback = Arc<dyn Fn(&[CertificateDer<'static>]) -> bool + Send + Sync>;

/// How a listener validates client certificates.
#[derive(Clone)]
pub enum CertificateValidator {
    /// Accept chains for which the callback returns true.
    Callback(CertificateCallback),
    /// Accept chains whose leaf is one of, or is signed by one of, these roots.
    RootCertificates(Vec<CertificateDer<'static>>),
}

impl fmt::Debug for CertificateValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("CertificateValidator::Callback"),
            Self::RootCertificates(roots) => f
                .debug_tuple("CertificateValidator::RootCertificates")
                .field(&roots.len())
                .finish(),
        }
    }
}

/// Authentication configuration.
///
/// Client-side variants ([`Basic`](Self::Basic) and
/// [`ClientCertificate`](Self::ClientCertificate)) are set on replicators.
/// Listener-side variants ([`Password`](Self::Password) and
/// [`Certificate`](Self::Certificate)) are set on listeners.
#[derive(Clone, Default)]
pub enum Authenticator {
    /// No authentication.
    #[default]
    None,
    /// HTTP Basic credentials sent by a replicator.
    Basic {
        /// Username.
        username: String,
        /// Password.
        password: String,
    },
    /// Client certificate presented by a replicator during the TLS handshake.
    ClientCertificate(TlsIdentity),
    /// Listener check of Basic credentials.
    Password(PasswordCallback),
    /// Listener check of client certificates.
    Certificate(CertificateValidator),
}

impl Authenticator {
    /// Basic credentials for a replicator.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Client certificate for a replicator.
    pub fn client_certificate(identity: TlsIdentity) -> Self {
        Self::ClientCertificate(identity)
    }

    /// Password check for a listener.
    pub fn password<F>(check: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        Self::Password(Arc::new(check))
    }

    /// Client certificate check for a listener, by callback.
    pub fn certificate<F>(check: F) -> Self
    where
        F: Fn(&[CertificateDer<'static>]) -> bool + Send + Sync + 'static,
    {
        Self::Certificate(CertificateValidator::Callback(Arc::new(check)))
    }

    /// Client certificate check for a listener, by trusted roots.
    pub fn certificate_roots(roots: Vec<CertificateDer<'static>>) -> Self {
        Self::Certificate(CertificateValidator::RootCertificates(roots))
    }

    /// Returns true for variants used by listeners.
    pub fn is_listener_side(&self) -> bool {
        matches!(self, Self::Password(_) | Self::Certificate(_))
    }

    /// Returns true for variants used by replicators.
    pub fn is_replicator_side(&self) -> bool {
        matches!(self, Self::Basic { .. } | Self::ClientCertificate(_))
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("Authenticator::None"),
            Self::Basic { username, .. } => f
                .debug_struct("Authenticator::Basic")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::ClientCertificate(identity) => f
                .debug_tuple("Authenticator::ClientCertificate")
                .field(identity)
                .finish(),
            Self::Password(_) => f.write_str("Authenticator::Password"),
            Self::Certificate(validator) => f
                .debug_tuple("Authenticator::Certificate")
                .field(validator)
                .finish(),
        }
    }
}
