//! # docsync protocol
//!
//! Replication wire protocol for docsync.
//!
//! This crate provides:
//! - Protocol messages (handshake, change subscription, revision batches,
//!   acknowledgements, checkpoints, close)
//! - Length-prefixed CBOR framing
//! - A cancel-safe [`Connection`] over TCP, TLS or in-process streams
//! - `Basic` authorization helpers
//!
//! The same protocol runs over a listener socket and over the in-process
//! pipe used for local database endpoints.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod codec;
mod connection;
mod error;
mod messages;

pub use auth::{basic_authorization, parse_basic_authorization};
pub use codec::{decode_message, encode_message, read_frame, write_frame, MAX_FRAME_LEN};
pub use connection::{BoxStream, Connection, Stream};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ErrorCode, Hello, Message, Rejection, Revs, RevsAck, SubChanges, Welcome, PROTOCOL_VERSION,
};
