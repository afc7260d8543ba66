//! Error types for replication.

use docsync_protocol::{ErrorCode, ProtocolError};
use docsync_store::StoreError;
use docsync_tls::{classify_tls_error, TlsError, TlsFailure};
use std::io;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors reported by replicators and replication sessions.
///
/// Errors are `Clone` so the last one can be kept in
/// [`ReplicatorStatus`](crate::ReplicatorStatus).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    /// The peer could not be reached (DNS failure, no route, connect timeout).
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// The peer refused the connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The connection failed after it was established.
    #[error("network error: {0}")]
    Network(String),

    /// The server certificate does not chain to a trusted root or pin.
    #[error("server certificate has an unknown root")]
    TlsCertUnknownRoot,

    /// The server certificate is not acceptable.
    #[error("server certificate is not trusted")]
    TlsCertUntrusted,

    /// The listener rejected the client certificate.
    #[error("client certificate rejected by peer")]
    TlsClientCertRejected,

    /// Credentials are missing or wrong.
    #[error("authentication required: {0}")]
    HttpAuthRequired(String),

    /// The peer refused the operation (for example, a push to a read-only listener).
    #[error("forbidden: {0}")]
    HttpForbidden(String),

    /// The remote database does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conflict could not be resolved.
    #[error("conflict on document {doc_id}")]
    Conflict {
        /// Document ID.
        doc_id: String,
    },

    /// The operation is not available for this replicator.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The peer closed the connection because it is shutting down.
    #[error("peer going away: {0}")]
    WebSocketGoingAway(String),

    /// The peer violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The local database failed.
    #[error("database error: {0}")]
    Database(String),

    /// TLS could not be configured.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl ReplicationError {
    /// Returns true for network-level failures that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReplicationError::NetworkUnreachable(_)
                | ReplicationError::ConnectionRefused(_)
                | ReplicationError::Network(_)
                | ReplicationError::WebSocketGoingAway(_)
        )
    }

    /// Returns true if a session that failed with this error should be retried.
    ///
    /// A one-shot replicator stops when its peer goes away; a continuous one
    /// waits for the peer to come back.
    pub fn is_retryable(&self, continuous: bool) -> bool {
        match self {
            ReplicationError::WebSocketGoingAway(_) => continuous,
            other => other.is_transient(),
        }
    }

    /// Returns true for authentication and certificate failures.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ReplicationError::TlsCertUnknownRoot
                | ReplicationError::TlsCertUntrusted
                | ReplicationError::TlsClientCertRejected
                | ReplicationError::HttpAuthRequired(_)
        )
    }

    /// Maps an error or close code sent by the peer.
    pub fn from_peer(code: ErrorCode, message: &str) -> Self {
        let message = message.to_string();
        match code {
            ErrorCode::UNAUTHORIZED => ReplicationError::HttpAuthRequired(message),
            ErrorCode::FORBIDDEN => ReplicationError::HttpForbidden(message),
            ErrorCode::NOT_FOUND => ReplicationError::NotFound(message),
            ErrorCode::GOING_AWAY => ReplicationError::WebSocketGoingAway(message),
            ErrorCode::PROTOCOL | ErrorCode::UPGRADE_REQUIRED => ReplicationError::Protocol(message),
            _ => ReplicationError::Network(format!("peer error {code}: {message}")),
        }
    }

    /// Maps an I/O error from connecting or from an established stream.
    pub fn from_io(error: &io::Error) -> Self {
        if let Some(failure) = classify_tls_error(error) {
            return match failure {
                TlsFailure::UnknownRoot => ReplicationError::TlsCertUnknownRoot,
                TlsFailure::Untrusted => ReplicationError::TlsCertUntrusted,
                TlsFailure::ClientCertRejected => ReplicationError::TlsClientCertRejected,
            };
        }
        match error.kind() {
            io::ErrorKind::ConnectionRefused => ReplicationError::ConnectionRefused(error.to_string()),
            io::ErrorKind::TimedOut
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::NotFound => ReplicationError::NetworkUnreachable(error.to_string()),
            _ => ReplicationError::Network(error.to_string()),
        }
    }
}

impl From<StoreError> for ReplicationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { doc_id } => ReplicationError::Conflict { doc_id },
            other => ReplicationError::Database(other.to_string()),
        }
    }
}

impl From<ProtocolError> for ReplicationError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(io) => ReplicationError::from_io(&io),
            ProtocolError::ConnectionClosed => {
                ReplicationError::Network("connection closed by peer".into())
            }
            other => ReplicationError::Protocol(other.to_string()),
        }
    }
}

impl From<TlsError> for ReplicationError {
    fn from(e: TlsError) -> Self {
        ReplicationError::Tls(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy() {
        assert!(ReplicationError::ConnectionRefused("x".into()).is_retryable(false));
        assert!(ReplicationError::Network("reset".into()).is_retryable(true));
        assert!(ReplicationError::WebSocketGoingAway("bye".into()).is_retryable(true));
        assert!(!ReplicationError::WebSocketGoingAway("bye".into()).is_retryable(false));
        assert!(!ReplicationError::TlsCertUnknownRoot.is_retryable(true));
        assert!(!ReplicationError::HttpAuthRequired("no".into()).is_retryable(true));
        assert!(!ReplicationError::HttpForbidden("ro".into()).is_retryable(true));
    }

    #[test]
    fn peer_codes() {
        assert_eq!(
            ReplicationError::from_peer(ErrorCode::UNAUTHORIZED, "login"),
            ReplicationError::HttpAuthRequired("login".into())
        );
        assert_eq!(
            ReplicationError::from_peer(ErrorCode::FORBIDDEN, "read-only"),
            ReplicationError::HttpForbidden("read-only".into())
        );
        assert!(matches!(
            ReplicationError::from_peer(ErrorCode::GOING_AWAY, ""),
            ReplicationError::WebSocketGoingAway(_)
        ));
    }

    #[test]
    fn io_errors() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            ReplicationError::from_io(&refused),
            ReplicationError::ConnectionRefused(_)
        ));
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(matches!(
            ReplicationError::from_io(&timeout),
            ReplicationError::NetworkUnreachable(_)
        ));
        let tls = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        assert_eq!(
            ReplicationError::from_io(&tls),
            ReplicationError::TlsCertUnknownRoot
        );
    }

    #[test]
    fn store_conflicts_are_kept() {
        let err: ReplicationError = StoreError::conflict("doc-1").into();
        assert_eq!(
            err,
            ReplicationError::Conflict {
                doc_id: "doc-1".into()
            }
        );
    }
}
