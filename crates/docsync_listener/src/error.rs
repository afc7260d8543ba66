//! Error types for the listener.

use docsync_store::StoreError;
use docsync_tls::TlsError;
use std::io;
use thiserror::Error;

/// Result type for listener operations.
pub type ListenerResult<T> = Result<T, ListenerError>;

/// Errors returned by [`UrlEndpointListener::start`](crate::UrlEndpointListener::start)
/// and identity maintenance.
#[derive(Error, Debug)]
pub enum ListenerError {
    /// The requested port is already bound by another socket.
    #[error("address in use: {0}")]
    AddressInUse(String),

    /// The listener identity or TLS configuration could not be set up.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// The database refused the listener (typically because it is closed).
    #[error("database error: {0}")]
    Database(#[from] StoreError),

    /// The configuration cannot be served.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ListenerError {
    /// Maps a bind failure, singling out an occupied port.
    pub(crate) fn from_bind(error: io::Error, address: &str) -> Self {
        if error.kind() == io::ErrorKind::AddrInUse {
            ListenerError::AddressInUse(address.to_string())
        } else {
            ListenerError::Io(error)
        }
    }

    /// Returns true if starting again later may succeed without changing
    /// the configuration.
    pub fn is_transient(&self) -> bool {
        matches!(self, ListenerError::AddressInUse(_) | ListenerError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_errors() {
        let err = ListenerError::from_bind(io::Error::from(io::ErrorKind::AddrInUse), "0.0.0.0:4984");
        assert!(matches!(err, ListenerError::AddressInUse(ref a) if a == "0.0.0.0:4984"));
        assert!(err.is_transient());

        let err = ListenerError::from_bind(io::Error::from(io::ErrorKind::PermissionDenied), "x");
        assert!(matches!(err, ListenerError::Io(_)));
    }

    #[test]
    fn error_display() {
        let err = ListenerError::InvalidConfiguration("no TLS".into());
        assert!(err.to_string().contains("no TLS"));
        assert!(!err.is_transient());
    }
}
