//! Protocol error types.

use std::io;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while encoding, decoding or exchanging messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Transport I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// A frame did not contain a valid message.
    #[error("decode error: {0}")]
    Decode(String),

    /// A frame exceeded the maximum size.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced frame length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// The peer sent a message that is not valid at this point.
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        /// What was expected.
        expected: &'static str,
        /// What arrived.
        got: &'static str,
    },

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl ProtocolError {
    /// Creates an unexpected-message error.
    pub fn unexpected(expected: &'static str, got: &'static str) -> Self {
        Self::UnexpectedMessage { expected, got }
    }

    /// Returns the underlying I/O error, if any.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            ProtocolError::Io(e) => Some(e),
            _ => None,
        }
    }
}
