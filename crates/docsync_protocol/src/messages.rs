//! Protocol messages.
//!
//! A replication connection is a sequence of [`Message`]s exchanged between
//! an active peer (the replicator) and a passive peer (a listener or a local
//! database endpoint).
//!
//! ```text
//! active                         passive
//!   Hello ───────────────────────▶
//!         ◀─────────────────────── Welcome | Error
//!   SubChanges ──────────────────▶              (pull)
//!         ◀─────────────────────── Revs* CaughtUp [Revs* ...]
//!   SetCheckpoint ───────────────▶
//!   Revs ────────────────────────▶              (push)
//!         ◀─────────────────────── RevsAck
//!   Ping ────────────────────────▶              (heartbeat)
//!         ◀─────────────────────── Pong
//!   Close ◀──────────────────────▶ Close
//! ```
//!
//! Pull and push run concurrently over one connection.

use docsync_store::{Revision, RevisionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Numeric status code carried by errors, rejections and close frames.
///
/// HTTP-style codes describe request failures; 1000-range codes mirror
/// WebSocket close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    /// Orderly close.
    pub const NORMAL: Self = Self(1000);
    /// Peer is shutting down.
    pub const GOING_AWAY: Self = Self(1001);
    /// Peer violated the protocol.
    pub const PROTOCOL: Self = Self(1002);
    /// Missing or wrong credentials.
    pub const UNAUTHORIZED: Self = Self(401);
    /// Operation not permitted (for example, pushing to a read-only peer).
    pub const FORBIDDEN: Self = Self(403);
    /// Unknown database.
    pub const NOT_FOUND: Self = Self(404);
    /// Revision conflicts with the peer's current revision.
    pub const CONFLICT: Self = Self(409);
    /// Unsupported protocol version.
    pub const UPGRADE_REQUIRED: Self = Self(426);
    /// Peer failed internally.
    pub const INTERNAL: Self = Self(500);

    /// Returns the numeric code.
    pub fn code(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opening message from the active peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version spoken by the active peer.
    pub protocol_version: u16,
    /// Name of the passive database to replicate with.
    pub database: String,
    /// Checkpoint ID the active peer uses for this relationship.
    pub checkpoint_id: String,
    /// `Authorization` value, e.g. `Basic <base64>`.
    pub authorization: Option<String>,
    /// Extra headers supplied by the application.
    pub headers: BTreeMap<String, String>,
    /// Whether the active peer would accept delta-encoded revisions.
    pub delta_sync: bool,
}

/// Successful handshake reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    /// UUID of the passive database.
    pub database_uuid: uuid::Uuid,
    /// Pull sequence the active peer last stored here, if any.
    pub remote_checkpoint: Option<u64>,
}

/// Request to stream changes after a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubChanges {
    /// Send changes with a sequence above this.
    pub since: u64,
    /// Keep streaming new changes after catching up.
    pub continuous: bool,
    /// Maximum revisions per `Revs` batch.
    pub batch_size: u32,
}

/// A batch of revisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revs {
    /// Revisions in sender sequence order.
    pub revisions: Vec<Revision>,
    /// Highest sender sequence covered by this batch.
    pub sequence: u64,
}

/// Rejection of a single pushed revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Document ID.
    pub doc_id: String,
    /// Revision that was rejected.
    pub rev_id: RevisionId,
    /// Why it was rejected.
    pub code: ErrorCode,
}

/// Acknowledgement of a pushed batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevsAck {
    /// Revisions now stored by the receiver.
    pub accepted: Vec<(String, RevisionId)>,
    /// Revisions the receiver refused.
    pub rejected: Vec<Rejection>,
}

/// A replication protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Handshake request.
    Hello(Hello),
    /// Handshake accepted.
    Welcome(Welcome),
    /// Request failed.
    Error {
        /// Status code.
        code: ErrorCode,
        /// Human readable reason.
        message: String,
    },
    /// Subscribe to changes (pull).
    SubChanges(SubChanges),
    /// Batch of revisions (pull response or push request).
    Revs(Revs),
    /// All changes up to `sequence` have been sent.
    CaughtUp {
        /// Sender's current sequence.
        sequence: u64,
    },
    /// Acknowledgement of a pushed batch.
    RevsAck(RevsAck),
    /// Store the active peer's pull progress on the passive side.
    SetCheckpoint {
        /// Active peer's checkpoint ID.
        checkpoint_id: String,
        /// Pull sequence reached.
        sequence: u64,
    },
    /// Heartbeat request.
    Ping,
    /// Heartbeat reply.
    Pong,
    /// The connection is ending.
    Close {
        /// Close code.
        code: ErrorCode,
        /// Human readable reason.
        reason: String,
    },
}

impl Message {
    /// Returns the message name, for logging and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello(_) => "Hello",
            Message::Welcome(_) => "Welcome",
            Message::Error { .. } => "Error",
            Message::SubChanges(_) => "SubChanges",
            Message::Revs(_) => "Revs",
            Message::CaughtUp { .. } => "CaughtUp",
            Message::RevsAck(_) => "RevsAck",
            Message::SetCheckpoint { .. } => "SetCheckpoint",
            Message::Ping => "Ping",
            Message::Pong => "Pong",
            Message::Close { .. } => "Close",
        }
    }

    /// Creates an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error {
            code,
            message: message.into(),
        }
    }

    /// Creates a close message.
    pub fn close(code: ErrorCode, reason: impl Into<String>) -> Self {
        Message::Close {
            code,
            reason: reason.into(),
        }
    }
}
