//! Conflict resolution.
//!
//! A conflict arises when a pulled revision and the local revision of the
//! same document are on diverging branches. The resolver picks the content
//! to keep; the result is written atomically against the local revision it
//! was computed from. If the local document changed while the resolver ran,
//! resolution is repeated against the new local revision, up to
//! [`MAX_RESOLVE_ATTEMPTS`] times.

use crate::error::{ReplicationError, ReplicationResult};
use docsync_store::{ApplyOutcome, Database, Document, Resolution, Revision};

/// How many times resolution is retried when the local document keeps
/// changing underneath it.
pub const MAX_RESOLVE_ATTEMPTS: usize = 5;

/// The revisions involved in a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// Document ID.
    pub doc_id: String,
    /// Local revision when the conflict was detected.
    pub local: Document,
    /// Incoming remote revision.
    pub remote: Document,
    /// Latest local revision, if it was written by someone else after
    /// `local` was read.
    pub current: Option<Document>,
}

/// Picks the winner of a conflict.
///
/// Returning `conflict.remote` unchanged keeps the remote revision. Any
/// other document is stored as a new revision descending from both sides;
/// a deleted document stores a deletion.
pub trait ConflictResolver: Send + Sync {
    /// Resolves a conflict.
    fn resolve(&self, conflict: &Conflict) -> Document;
}

impl<F> ConflictResolver for F
where
    F: Fn(&Conflict) -> Document + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict) -> Document {
        self(conflict)
    }
}

/// Deletion wins; otherwise the higher generation wins, ties going to the
/// larger revision ID.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConflictResolver;

impl ConflictResolver for DefaultConflictResolver {
    fn resolve(&self, conflict: &Conflict) -> Document {
        let local = conflict.current.as_ref().unwrap_or(&conflict.local);
        let remote = &conflict.remote;

        if remote.is_deleted() != local.is_deleted() {
            return if remote.is_deleted() {
                remote.clone()
            } else {
                local.clone()
            };
        }
        if remote.revision() > local.revision() {
            remote.clone()
        } else {
            local.clone()
        }
    }
}

fn is_unchanged_remote(chosen: &Document, remote: &Revision) -> bool {
    chosen.revision() == Some(&remote.rev_id)
        && chosen.is_deleted() == remote.deleted
        && (remote.deleted || chosen.properties() == &remote.body)
}

/// Resolves a conflict between `remote` and the local revision `local`
/// and stores the result. Blocking: runs user code.
pub fn resolve_conflict(
    db: &Database,
    resolver: &dyn ConflictResolver,
    remote: &Revision,
    local: Revision,
) -> ReplicationResult<Document> {
    let local_doc = Document::from_revision(&local);
    let remote_doc = Document::from_revision(remote);
    let mut base = local;
    let mut current: Option<Document> = None;

    for attempt in 0..MAX_RESOLVE_ATTEMPTS {
        let conflict = Conflict {
            doc_id: remote.doc_id.clone(),
            local: local_doc.clone(),
            remote: remote_doc.clone(),
            current: current.clone(),
        };
        let chosen = resolver.resolve(&conflict);
        let resolution = if is_unchanged_remote(&chosen, remote) {
            Resolution::Remote
        } else {
            Resolution::Merged(chosen)
        };

        match db.save_resolved(&base.rev_id, remote, resolution) {
            Ok(doc) => {
                tracing::debug!(
                    doc_id = %remote.doc_id,
                    attempt,
                    "conflict resolved"
                );
                return Ok(doc);
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(doc_id = %remote.doc_id, attempt, "local document changed during resolution");
            }
            Err(e) => return Err(e.into()),
        }

        // The local document moved on; find out where to.
        match db.current_revision(&remote.doc_id)? {
            Some(latest) if latest.descends_from(&remote.rev_id) => {
                return Ok(Document::from_revision(&latest));
            }
            Some(latest) => {
                current = Some(Document::from_revision(&latest));
                base = latest;
            }
            None => match db.apply_revision(remote)? {
                ApplyOutcome::Inserted(doc) | ApplyOutcome::FastForwarded(doc) => return Ok(doc),
                ApplyOutcome::AlreadyKnown => {
                    return Ok(remote_doc);
                }
                ApplyOutcome::Conflict { local } => {
                    current = Some(Document::from_revision(&local));
                    base = local;
                }
            },
        }
    }

    tracing::warn!(doc_id = %remote.doc_id, "giving up on conflict resolution");
    Err(ReplicationError::Conflict {
        doc_id: remote.doc_id.clone(),
    })
}
