//! Replication checkpoints.
//!
//! A [`Checkpoint`] is the local bookkeeping of one replication relationship:
//! how far the peer's change sequence has been pulled, and which revision of
//! each document the peer is known to have. A document is pending push when
//! its current revision differs from the one recorded here.
//!
//! Checkpoint IDs are derived from the local database UUID and a key naming
//! the remote endpoint, so two replicators with the same endpoint share one.

use crate::revision::RevisionId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Progress of one replication relationship.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Highest peer sequence whose changes have all been pulled.
    pub pull_sequence: u64,
    /// Revision of each document known to exist on the peer.
    pub remote_revisions: BTreeMap<String, RevisionId>,
}

impl Checkpoint {
    /// Returns the revision the peer is known to have for a document.
    pub fn remote_revision(&self, doc_id: &str) -> Option<&RevisionId> {
        self.remote_revisions.get(doc_id)
    }

    /// Returns true if the peer is known to have exactly `rev_id`.
    pub fn is_known(&self, doc_id: &str, rev_id: &RevisionId) -> bool {
        self.remote_revisions.get(doc_id) == Some(rev_id)
    }

    /// Records that the peer has `rev_id` of a document.
    pub fn mark_known(&mut self, doc_id: impl Into<String>, rev_id: RevisionId) {
        self.remote_revisions.insert(doc_id.into(), rev_id);
    }
}

/// Derives a stable checkpoint ID for a (local database, remote endpoint) pair.
pub fn checkpoint_id(database_uuid: &uuid::Uuid, endpoint_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(database_uuid.as_bytes());
    hasher.update(endpoint_key.as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(40);
    format!("cp-{id}")
}
