//! Replicator status and document replication events.

use crate::config::DocumentFlags;
use crate::error::ReplicationError;

/// What a replicator is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityLevel {
    /// Not running.
    Stopped,
    /// Waiting to retry after a network failure (continuous mode only).
    Offline,
    /// Opening the connection and handshaking.
    Connecting,
    /// Connected with nothing to transfer.
    Idle,
    /// Transferring documents.
    Busy,
}

impl ActivityLevel {
    /// Returns true for every level except `Stopped`.
    pub fn is_running(self) -> bool {
        !matches!(self, ActivityLevel::Stopped)
    }
}

/// Transfer progress counted in revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Revisions transferred.
    pub completed: u64,
    /// Revisions known to need transferring.
    pub total: u64,
}

impl Progress {
    /// Returns true if everything known has been transferred.
    pub fn is_complete(self) -> bool {
        self.completed >= self.total
    }

    fn add(self, other: Progress) -> Progress {
        Progress {
            completed: self.completed + other.completed,
            total: self.total + other.total,
        }
    }
}

/// Snapshot of a replicator's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatorStatus {
    /// Current activity.
    pub activity: ActivityLevel,
    /// Combined progress of both directions.
    pub progress: Progress,
    /// Push progress.
    pub push_progress: Progress,
    /// Pull progress.
    pub pull_progress: Progress,
    /// Last error, if any.
    pub error: Option<ReplicationError>,
}

impl ReplicatorStatus {
    pub(crate) fn stopped() -> Self {
        Self {
            activity: ActivityLevel::Stopped,
            progress: Progress::default(),
            push_progress: Progress::default(),
            pull_progress: Progress::default(),
            error: None,
        }
    }

    pub(crate) fn set_progress(&mut self, push: Progress, pull: Progress) {
        self.push_progress = push;
        self.pull_progress = pull;
        self.progress = push.add(pull);
    }
}

impl Default for ReplicatorStatus {
    fn default() -> Self {
        Self::stopped()
    }
}

/// Direction of a document transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationDirection {
    /// Local to remote.
    Push,
    /// Remote to local.
    Pull,
}

/// Outcome for one document in a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedDocument {
    /// Document ID.
    pub id: String,
    /// Flags of the transferred revision.
    pub flags: DocumentFlags,
    /// Why the transfer failed, if it did.
    pub error: Option<ReplicationError>,
}

/// A batch of documents pushed or pulled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentReplication {
    /// Transfer direction.
    pub direction: ReplicationDirection,
    /// Documents in the batch.
    pub documents: Vec<ReplicatedDocument>,
}

/// Handle returned when adding a listener, used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerToken(pub(crate) u64);
