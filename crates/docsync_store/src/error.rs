//! Error types for the document store.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in document store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Snapshot encoding or decoding failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the codec failure.
        message: String,
    },

    /// A save or resolution raced with another writer.
    #[error("conflict saving document {doc_id}")]
    Conflict {
        /// The document that conflicted.
        doc_id: String,
    },

    /// Document not found.
    #[error("document not found: {doc_id}")]
    DocumentNotFound {
        /// The missing document ID.
        doc_id: String,
    },

    /// Invalid document ID.
    #[error("invalid document id: {message}")]
    InvalidDocumentId {
        /// Why the ID was rejected.
        message: String,
    },

    /// Invalid revision ID string.
    #[error("invalid revision id: {0}")]
    InvalidRevisionId(String),

    /// Database is already open or locked.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Invalid database format or version.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,
}

impl StoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a conflict error.
    pub fn conflict(doc_id: impl Into<String>) -> Self {
        Self::Conflict {
            doc_id: doc_id.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(doc_id: impl Into<String>) -> Self {
        Self::DocumentNotFound {
            doc_id: doc_id.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if this error reports a write conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}
