//! Error types for TLS identities and verification.

use std::io;
use thiserror::Error;

/// Result type for TLS operations.
pub type TlsResult<T> = Result<T, TlsError>;

/// Errors from identity management and TLS configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    /// I/O error in the identity store.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Key pair or certificate generation failed.
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// A certificate could not be parsed or is unusable.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// A private key could not be parsed or does not match the certificate.
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// An identity with this label already exists.
    #[error("identity label already in use: {0}")]
    LabelExists(String),

    /// No identity stored under this label.
    #[error("identity not found: {0}")]
    IdentityNotFound(String),

    /// An identity bundle could not be decrypted (wrong password or corrupt).
    #[error("cannot decrypt identity bundle: {0}")]
    Decryption(String),

    /// Encoding or decoding of stored identity data failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// rustls rejected the configuration.
    #[error("TLS configuration error: {0}")]
    Config(String),
}

impl From<rustls::Error> for TlsError {
    fn from(e: rustls::Error) -> Self {
        TlsError::Config(e.to_string())
    }
}

impl From<rcgen::Error> for TlsError {
    fn from(e: rcgen::Error) -> Self {
        TlsError::CertificateGeneration(e.to_string())
    }
}
