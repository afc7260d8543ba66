//! Database facade.

use crate::change_feed::{ChangeEvent, ChangeFeed, ChangeOrigin, ChangeType};
use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::dir::DatabaseDir;
use crate::document::{validate_id, ConcurrencyControl, Document};
use crate::error::{StoreError, StoreResult};
use crate::registry::{ActiveResource, ActiveResourceRegistry, ResourceToken};
use crate::revision::{merge_history, Revision, RevisionId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Weak;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

/// Result of applying a revision received from a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The document did not exist locally and was created.
    Inserted(Document),
    /// The incoming revision descends from the local one and replaced it.
    FastForwarded(Document),
    /// The incoming revision is the local one or one of its ancestors.
    AlreadyKnown,
    /// The two revisions are on diverging branches. Nothing was written.
    Conflict {
        /// The current local revision.
        local: Revision,
    },
}

/// How a conflict between a local and a remote revision is settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the remote revision as is.
    Remote,
    /// Store a new revision merging both branches with this content.
    ///
    /// A deleted document produces a tombstone.
    Merged(Document),
}

/// Persistent state of a database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    format_version: (u16, u16),
    uuid: Uuid,
    last_sequence: u64,
    documents: BTreeMap<String, Revision>,
    checkpoints: BTreeMap<String, Checkpoint>,
    /// Pull sequences confirmed by peers that replicate against this database.
    peer_checkpoints: BTreeMap<String, u64>,
}

/// A revisioned JSON document database.
///
/// # Opening a Database
///
/// ```rust,ignore
/// use docsync_store::{Database, Document};
///
/// let db = Database::open(Path::new("my_database"))?;
/// db.save(&Document::new("profile").with_value("name", "alice"))?;
/// db.close()?;
/// ```
///
/// For tests, use `Database::open_in_memory(name)`.
///
/// # Active resources
///
/// Replicators and listeners bound to a database register themselves with
/// it. [`close`](Self::close) and [`delete`](Self::delete) stop every one of
/// them synchronously before the database becomes unusable.
pub struct Database {
    name: String,
    config: Config,
    /// Database directory (holds the lock). None for in-memory databases.
    dir: Mutex<Option<DatabaseDir>>,
    state: RwLock<Snapshot>,
    feed: ChangeFeed,
    resources: ActiveResourceRegistry,
    is_open: RwLock<bool>,
}

impl Database {
    /// Opens a database from a directory path.
    ///
    /// The database name is the last path component.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process has the database locked (`DatabaseLocked`)
    /// - The snapshot is corrupt (`InvalidFormat`)
    /// - I/O errors occur
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens a database from a directory path with custom configuration.
    pub fn open_with_config(path: &Path, config: Config) -> StoreResult<Self> {
        let dir = DatabaseDir::open(path, config.create_if_missing)?;

        if !config.create_if_missing && dir.is_new_database() {
            return Err(StoreError::invalid_format(
                "database does not exist and create_if_missing is false",
            ));
        }
        if config.error_if_exists && !dir.is_new_database() {
            return Err(StoreError::invalid_format(
                "database already exists and error_if_exists is true",
            ));
        }

        let snapshot = match dir.load_snapshot::<Snapshot>()? {
            Some(snapshot) => {
                if snapshot.format_version.0 != config.format_version.0 {
                    return Err(StoreError::invalid_format(format!(
                        "unsupported format version {}.{}",
                        snapshot.format_version.0, snapshot.format_version.1
                    )));
                }
                snapshot
            }
            None => {
                let snapshot = Self::fresh_snapshot(&config);
                dir.save_snapshot(&snapshot, config.sync_on_commit)?;
                snapshot
            }
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "db".to_string());

        tracing::debug!(
            name = %name,
            documents = snapshot.documents.len(),
            sequence = snapshot.last_sequence,
            "opened database"
        );

        Ok(Self::from_parts(name, config, Some(dir), snapshot))
    }

    /// Opens a fresh in-memory database.
    pub fn open_in_memory(name: impl Into<String>) -> StoreResult<Self> {
        let config = Config::default();
        let snapshot = Self::fresh_snapshot(&config);
        Ok(Self::from_parts(name.into(), config, None, snapshot))
    }

    fn fresh_snapshot(config: &Config) -> Snapshot {
        Snapshot {
            format_version: config.format_version,
            uuid: Uuid::new_v4(),
            ..Snapshot::default()
        }
    }

    fn from_parts(
        name: String,
        config: Config,
        dir: Option<DatabaseDir>,
        snapshot: Snapshot,
    ) -> Self {
        Self {
            name,
            config,
            dir: Mutex::new(dir),
            state: RwLock::new(snapshot),
            feed: ChangeFeed::new(),
            resources: ActiveResourceRegistry::new(),
            is_open: RwLock::new(true),
        }
    }

    /// Returns the database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the database UUID, stable across reopens.
    pub fn uuid(&self) -> Uuid {
        self.state.read().uuid
    }

    /// Returns the database directory, if persistent.
    pub fn path(&self) -> Option<PathBuf> {
        self.dir.lock().as_ref().map(|d| d.path().to_path_buf())
    }

    /// Returns database configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the sequence of the latest commit.
    pub fn last_sequence(&self) -> u64 {
        self.state.read().last_sequence
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Returns a live document, or None if missing or deleted.
    pub fn get(&self, id: &str) -> StoreResult<Option<Document>> {
        self.ensure_open()?;
        let state = self.state.read();
        Ok(state
            .documents
            .get(id)
            .filter(|rev| !rev.deleted)
            .map(Document::from_revision))
    }

    /// Returns the current revision of a document, tombstones included.
    pub fn current_revision(&self, id: &str) -> StoreResult<Option<Revision>> {
        self.ensure_open()?;
        Ok(self.state.read().documents.get(id).cloned())
    }

    /// Saves a document, overwriting whatever revision is current.
    pub fn save(&self, doc: &Document) -> StoreResult<Document> {
        self.save_with_concurrency(doc, ConcurrencyControl::LastWriteWins)
    }

    /// Saves a document with the given concurrency control.
    ///
    /// # Errors
    ///
    /// With [`ConcurrencyControl::FailOnConflict`], returns
    /// [`StoreError::Conflict`] if the document changed since `doc` was read.
    pub fn save_with_concurrency(
        &self,
        doc: &Document,
        concurrency: ConcurrencyControl,
    ) -> StoreResult<Document> {
        validate_id(doc.id())?;
        self.write_local(doc.id(), doc.is_deleted(), doc.properties().clone(), |current| {
            if concurrency == ConcurrencyControl::FailOnConflict
                && current.map(|c| &c.rev_id) != doc.revision()
            {
                return Err(StoreError::conflict(doc.id()));
            }
            Ok(())
        })
    }

    /// Deletes a document, leaving a tombstone that replicates.
    ///
    /// # Errors
    ///
    /// Returns `DocumentNotFound` if the document is missing or already deleted.
    pub fn delete_document(&self, id: &str) -> StoreResult<Document> {
        self.write_local(id, true, Map::new(), |current| match current {
            Some(rev) if !rev.deleted => Ok(()),
            _ => Err(StoreError::not_found(id)),
        })
    }

    fn write_local(
        &self,
        id: &str,
        deleted: bool,
        body: Map<String, serde_json::Value>,
        check: impl FnOnce(Option<&Revision>) -> StoreResult<()>,
    ) -> StoreResult<Document> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let current = state.documents.get(id);
        check(current)?;

        let parent = current.map(|c| c.rev_id.clone());
        let history: Vec<RevisionId> = match current {
            Some(c) => c.lineage().take(self.history_limit()).cloned().collect(),
            None => Vec::new(),
        };
        let body = if deleted { Map::new() } else { body };
        let rev_id = RevisionId::derive(parent.as_ref(), deleted, &body);

        state.last_sequence += 1;
        let revision = Revision {
            doc_id: id.to_string(),
            rev_id,
            history,
            deleted,
            body,
            sequence: state.last_sequence,
        };
        let change_type = if deleted {
            ChangeType::Delete
        } else {
            ChangeType::Save
        };
        self.commit_revision(&mut state, revision, change_type, ChangeOrigin::Local)
    }

    /// Removes a document and all its revisions. Purges do not replicate.
    pub fn purge_document(&self, id: &str) -> StoreResult<()> {
        self.ensure_open()?;
        let mut state = self.state.write();
        if state.documents.remove(id).is_none() {
            return Err(StoreError::not_found(id));
        }
        for checkpoint in state.checkpoints.values_mut() {
            checkpoint.remote_revisions.remove(id);
        }
        state.last_sequence += 1;
        let sequence = state.last_sequence;
        self.persist(&state)?;
        self.feed.emit(ChangeEvent {
            sequence,
            doc_id: id.to_string(),
            rev_id: None,
            change_type: ChangeType::Purge,
            origin: ChangeOrigin::Local,
        });
        Ok(())
    }

    /// Returns the IDs of all live documents.
    pub fn document_ids(&self) -> StoreResult<Vec<String>> {
        self.ensure_open()?;
        let state = self.state.read();
        Ok(state
            .documents
            .values()
            .filter(|rev| !rev.deleted)
            .map(|rev| rev.doc_id.clone())
            .collect())
    }

    /// Returns the number of live documents.
    pub fn document_count(&self) -> usize {
        self.state
            .read()
            .documents
            .values()
            .filter(|rev| !rev.deleted)
            .count()
    }

    /// Returns current revisions stored after `since`, in sequence order.
    pub fn changes_since(&self, since: u64, limit: usize) -> StoreResult<Vec<Revision>> {
        self.ensure_open()?;
        let state = self.state.read();
        let mut changes: Vec<Revision> = state
            .documents
            .values()
            .filter(|rev| rev.sequence > since)
            .cloned()
            .collect();
        changes.sort_by_key(|rev| rev.sequence);
        changes.truncate(limit);
        Ok(changes)
    }

    /// Subscribes to committed changes.
    pub fn subscribe(&self) -> UnboundedReceiver<ChangeEvent> {
        self.feed.subscribe()
    }

    // ========================================================================
    // Replication
    // ========================================================================

    /// Applies a revision received from a peer.
    ///
    /// Conflicting revisions are reported, never written; the caller settles
    /// them with [`save_resolved`](Self::save_resolved).
    pub fn apply_revision(&self, incoming: &Revision) -> StoreResult<ApplyOutcome> {
        validate_id(&incoming.doc_id)?;
        self.ensure_open()?;
        let mut state = self.state.write();

        let fast_forward = match state.documents.get(&incoming.doc_id) {
            None => false,
            Some(local) if local.descends_from(&incoming.rev_id) => {
                return Ok(ApplyOutcome::AlreadyKnown);
            }
            Some(local) if incoming.descends_from(&local.rev_id) => true,
            Some(local) => {
                return Ok(ApplyOutcome::Conflict {
                    local: local.clone(),
                });
            }
        };

        state.last_sequence += 1;
        let revision = Revision {
            doc_id: incoming.doc_id.clone(),
            rev_id: incoming.rev_id.clone(),
            history: merge_history(
                incoming.history.iter(),
                &incoming.rev_id,
                self.history_limit(),
            ),
            deleted: incoming.deleted,
            body: if incoming.deleted {
                Map::new()
            } else {
                incoming.body.clone()
            },
            sequence: state.last_sequence,
        };
        let change_type = if revision.deleted {
            ChangeType::Delete
        } else {
            ChangeType::Save
        };
        let doc = self.commit_revision(&mut state, revision, change_type, ChangeOrigin::Remote)?;
        Ok(if fast_forward {
            ApplyOutcome::FastForwarded(doc)
        } else {
            ApplyOutcome::Inserted(doc)
        })
    }

    /// Stores the resolution of a conflict between the local revision
    /// `expected_local` and `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the local revision changed since
    /// the conflict was detected; the caller should re-detect and retry.
    pub fn save_resolved(
        &self,
        expected_local: &RevisionId,
        remote: &Revision,
        resolution: Resolution,
    ) -> StoreResult<Document> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let local = match state.documents.get(&remote.doc_id) {
            Some(local) if &local.rev_id == expected_local => local.clone(),
            _ => return Err(StoreError::conflict(&remote.doc_id)),
        };
        let limit = self.history_limit();

        state.last_sequence += 1;
        let sequence = state.last_sequence;
        let (revision, origin) = match resolution {
            Resolution::Remote => {
                let history = merge_history(
                    remote.history.iter().chain(local.lineage()),
                    &remote.rev_id,
                    limit,
                );
                let revision = Revision {
                    history,
                    sequence,
                    body: if remote.deleted {
                        Map::new()
                    } else {
                        remote.body.clone()
                    },
                    ..remote.clone()
                };
                (revision, ChangeOrigin::Remote)
            }
            Resolution::Merged(doc) => {
                let deleted = doc.is_deleted();
                let body = if deleted {
                    Map::new()
                } else {
                    doc.properties().clone()
                };
                let rev_id = RevisionId::derive_merge(&local.rev_id, &remote.rev_id, deleted, &body);
                let history = merge_history(remote.lineage().chain(local.lineage()), &rev_id, limit);
                let revision = Revision {
                    doc_id: remote.doc_id.clone(),
                    rev_id,
                    history,
                    deleted,
                    body,
                    sequence,
                };
                (revision, ChangeOrigin::Local)
            }
        };

        let change_type = if revision.deleted {
            ChangeType::Delete
        } else {
            ChangeType::Save
        };
        tracing::debug!(
            doc_id = %revision.doc_id,
            rev_id = %revision.rev_id,
            "stored conflict resolution"
        );
        self.commit_revision(&mut state, revision, change_type, origin)
    }

    /// Returns documents whose current revision is not known to the peer
    /// of the given checkpoint, in sequence order.
    pub fn unsynced_revisions(&self, checkpoint_id: &str) -> StoreResult<Vec<Revision>> {
        self.ensure_open()?;
        let state = self.state.read();
        let checkpoint = state.checkpoints.get(checkpoint_id);
        let mut revisions: Vec<Revision> = state
            .documents
            .values()
            .filter(|rev| !checkpoint.is_some_and(|cp| cp.is_known(&rev.doc_id, &rev.rev_id)))
            .cloned()
            .collect();
        revisions.sort_by_key(|rev| rev.sequence);
        Ok(revisions)
    }

    /// Returns the current revision of a document if it is not known to
    /// the peer of the given checkpoint.
    pub fn unsynced_revision(&self, checkpoint_id: &str, doc_id: &str) -> StoreResult<Option<Revision>> {
        self.ensure_open()?;
        let state = self.state.read();
        let checkpoint = state.checkpoints.get(checkpoint_id);
        Ok(state
            .documents
            .get(doc_id)
            .filter(|rev| !checkpoint.is_some_and(|cp| cp.is_known(&rev.doc_id, &rev.rev_id)))
            .cloned())
    }

    /// Returns a checkpoint, or an empty one if none was stored.
    pub fn checkpoint(&self, checkpoint_id: &str) -> StoreResult<Checkpoint> {
        self.ensure_open()?;
        Ok(self
            .state
            .read()
            .checkpoints
            .get(checkpoint_id)
            .cloned()
            .unwrap_or_default())
    }

    /// Updates a checkpoint in place and persists it.
    pub fn update_checkpoint<F>(&self, checkpoint_id: &str, f: F) -> StoreResult<Checkpoint>
    where
        F: FnOnce(&mut Checkpoint),
    {
        self.ensure_open()?;
        let mut state = self.state.write();
        let checkpoint = state
            .checkpoints
            .entry(checkpoint_id.to_string())
            .or_default();
        f(checkpoint);
        let updated = checkpoint.clone();
        self.persist(&state)?;
        Ok(updated)
    }

    /// Forgets a checkpoint so the next replication starts from scratch.
    pub fn reset_checkpoint(&self, checkpoint_id: &str) -> StoreResult<()> {
        self.ensure_open()?;
        let mut state = self.state.write();
        if state.checkpoints.remove(checkpoint_id).is_some() {
            self.persist(&state)?;
        }
        Ok(())
    }

    /// Returns the pull sequence a peer stored here under `checkpoint_id`.
    pub fn peer_checkpoint(&self, checkpoint_id: &str) -> StoreResult<Option<u64>> {
        self.ensure_open()?;
        Ok(self.state.read().peer_checkpoints.get(checkpoint_id).copied())
    }

    /// Stores a peer's pull sequence under `checkpoint_id`.
    pub fn set_peer_checkpoint(&self, checkpoint_id: &str, sequence: u64) -> StoreResult<()> {
        self.ensure_open()?;
        let mut state = self.state.write();
        state
            .peer_checkpoints
            .insert(checkpoint_id.to_string(), sequence);
        self.persist(&state)
    }

    // ========================================================================
    // Active resources
    // ========================================================================

    /// Registers a resource that must be stopped before this database closes.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` if the database is closed or closing.
    pub fn register_active_resource(
        &self,
        resource: Weak<dyn ActiveResource>,
    ) -> StoreResult<ResourceToken> {
        self.ensure_open()?;
        self.resources
            .register(resource)
            .ok_or(StoreError::DatabaseClosed)
    }

    /// Unregisters a resource. Unknown tokens are ignored.
    pub fn unregister_active_resource(&self, token: ResourceToken) {
        self.resources.unregister(token);
    }

    /// Returns the number of live registered resources.
    pub fn active_resource_count(&self) -> usize {
        self.resources.len()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Closes the database.
    ///
    /// Every registered replicator and listener is stopped first; this call
    /// blocks until they have finished.
    pub fn close(&self) -> StoreResult<()> {
        if !self.is_open() {
            return Ok(());
        }

        self.resources.stop_all();

        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }
        {
            let state = self.state.read();
            self.persist(&state)?;
        }
        self.feed.close();
        *is_open = false;
        tracing::debug!(name = %self.name, "closed database");
        Ok(())
    }

    /// Closes the database and removes its files.
    pub fn delete(&self) -> StoreResult<()> {
        self.close()?;
        if let Some(dir) = self.dir.lock().take() {
            let path = dir.path().to_path_buf();
            drop(dir);
            fs::remove_dir_all(&path)?;
            tracing::info!(path = %path.display(), "deleted database");
        }
        Ok(())
    }

    /// Checks if the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(StoreError::DatabaseClosed)
        }
    }

    fn history_limit(&self) -> usize {
        self.config.max_revision_history.max(1)
    }

    fn commit_revision(
        &self,
        state: &mut Snapshot,
        revision: Revision,
        change_type: ChangeType,
        origin: ChangeOrigin,
    ) -> StoreResult<Document> {
        let doc = Document::from_revision(&revision);
        let event = ChangeEvent {
            sequence: revision.sequence,
            doc_id: revision.doc_id.clone(),
            rev_id: Some(revision.rev_id.clone()),
            change_type,
            origin,
        };
        state.documents.insert(revision.doc_id.clone(), revision);
        self.persist(state)?;
        self.feed.emit(event);
        Ok(doc)
    }

    fn persist(&self, state: &Snapshot) -> StoreResult<()> {
        if let Some(dir) = self.dir.lock().as_ref() {
            dir.save_snapshot(state, self.config.sync_on_commit)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("is_open", &self.is_open())
            .field("document_count", &self.document_count())
            .field("last_sequence", &self.last_sequence())
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_db() -> Database {
        Database::open_in_memory("test").unwrap()
    }

    fn doc(id: &str, value: i64) -> Document {
        Document::new(id).with_value("value", value)
    }

    #[test]
    fn save_and_get() {
        let db = create_db();
        let saved = db.save(&doc("a", 1)).unwrap();
        assert_eq!(saved.revision().unwrap().generation(), 1);

        let loaded = db.get("a").unwrap().unwrap();
        assert_eq!(loaded.get("value"), Some(&json!(1)));
        assert_eq!(loaded.revision(), saved.revision());
        assert_eq!(db.document_count(), 1);
    }

    #[test]
    fn update_extends_history() {
        let db = create_db();
        let first = db.save(&doc("a", 1)).unwrap();
        let second = db.save(&doc("a", 2)).unwrap();
        assert_eq!(second.revision().unwrap().generation(), 2);

        let rev = db.current_revision("a").unwrap().unwrap();
        assert_eq!(rev.history, vec![first.revision().unwrap().clone()]);
    }

    #[test]
    fn fail_on_conflict() {
        let db = create_db();
        let saved = db.save(&doc("a", 1)).unwrap();
        db.save(&doc("a", 2)).unwrap();

        let mut stale = saved.clone();
        stale.set("value", 3);
        let err = db
            .save_with_concurrency(&stale, ConcurrencyControl::FailOnConflict)
            .unwrap_err();
        assert!(err.is_conflict());

        let fresh = db.get("a").unwrap().unwrap().with_value("value", 4);
        db.save_with_concurrency(&fresh, ConcurrencyControl::FailOnConflict)
            .unwrap();
    }

    #[test]
    fn delete_leaves_tombstone() {
        let db = create_db();
        db.save(&doc("a", 1)).unwrap();
        let tombstone = db.delete_document("a").unwrap();
        assert!(tombstone.is_deleted());

        assert!(db.get("a").unwrap().is_none());
        assert!(db.current_revision("a").unwrap().unwrap().deleted);
        assert_eq!(db.document_count(), 0);
        assert!(matches!(
            db.delete_document("a"),
            Err(StoreError::DocumentNotFound { .. })
        ));
    }

    #[test]
    fn purge_removes_everything() {
        let db = create_db();
        db.save(&doc("a", 1)).unwrap();
        db.purge_document("a").unwrap();
        assert!(db.current_revision("a").unwrap().is_none());
        assert!(db.purge_document("a").is_err());
    }

    #[test]
    fn changes_since_returns_latest_per_document() {
        let db = create_db();
        db.save(&doc("a", 1)).unwrap();
        db.save(&doc("b", 1)).unwrap();
        db.save(&doc("a", 2)).unwrap();

        let changes = db.changes_since(0, 100).unwrap();
        let ids: Vec<&str> = changes.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let changes = db.changes_since(2, 100).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].sequence, 3);
    }

    #[test]
    fn subscribers_see_commits() {
        let db = create_db();
        let mut rx = db.subscribe();
        db.save(&doc("a", 1)).unwrap();
        db.delete_document("a").unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.change_type, ChangeType::Save);
        assert_eq!(first.origin, ChangeOrigin::Local);
        assert_eq!(rx.try_recv().unwrap().change_type, ChangeType::Delete);
    }

    fn remote_child(parent: &Revision, value: i64) -> Revision {
        let body = doc(&parent.doc_id, value).properties().clone();
        Revision {
            doc_id: parent.doc_id.clone(),
            rev_id: RevisionId::derive(Some(&parent.rev_id), false, &body),
            history: parent.lineage().cloned().collect(),
            deleted: false,
            body,
            sequence: 0,
        }
    }

    #[test]
    fn apply_classifies_revisions() {
        let db = create_db();
        db.save(&doc("a", 1)).unwrap();
        let base = db.current_revision("a").unwrap().unwrap();

        // Ancestor is already known.
        assert_eq!(db.apply_revision(&base).unwrap(), ApplyOutcome::AlreadyKnown);

        // Child fast-forwards.
        let child = remote_child(&base, 2);
        assert!(matches!(
            db.apply_revision(&child).unwrap(),
            ApplyOutcome::FastForwarded(_)
        ));
        assert_eq!(db.get("a").unwrap().unwrap().get("value"), Some(&json!(2)));

        // Sibling of a local edit conflicts.
        db.save(&doc("a", 3)).unwrap();
        let sibling = remote_child(&child, 4);
        assert!(matches!(
            db.apply_revision(&sibling).unwrap(),
            ApplyOutcome::Conflict { .. }
        ));
        assert_eq!(db.get("a").unwrap().unwrap().get("value"), Some(&json!(3)));
    }

    #[test]
    fn apply_inserts_new_documents() {
        let source = create_db();
        source.save(&doc("x", 9)).unwrap();
        let rev = source.current_revision("x").unwrap().unwrap();

        let db = create_db();
        let mut rx = db.subscribe();
        assert!(matches!(
            db.apply_revision(&rev).unwrap(),
            ApplyOutcome::Inserted(_)
        ));
        assert_eq!(rx.try_recv().unwrap().origin, ChangeOrigin::Remote);
    }

    #[test]
    fn save_resolved_checks_local_revision() {
        let db = create_db();
        db.save(&doc("a", 1)).unwrap();
        let base = db.current_revision("a").unwrap().unwrap();
        let remote = remote_child(&base, 2);
        db.save(&doc("a", 3)).unwrap();
        let local = db.current_revision("a").unwrap().unwrap();

        // Stale expectation is rejected.
        let err = db
            .save_resolved(&base.rev_id, &remote, Resolution::Remote)
            .unwrap_err();
        assert!(err.is_conflict());

        let merged = db
            .save_resolved(
                &local.rev_id,
                &remote,
                Resolution::Merged(doc("a", 5)),
            )
            .unwrap();
        let stored = db.current_revision("a").unwrap().unwrap();
        assert_eq!(stored.rev_id.generation(), 3);
        assert!(stored.descends_from(&remote.rev_id));
        assert!(stored.descends_from(&local.rev_id));
        assert_eq!(merged.get("value"), Some(&json!(5)));
    }

    #[test]
    fn remote_resolution_keeps_remote_revision() {
        let db = create_db();
        db.save(&doc("a", 1)).unwrap();
        let base = db.current_revision("a").unwrap().unwrap();
        let remote = remote_child(&base, 2);
        db.save(&doc("a", 3)).unwrap();
        let local = db.current_revision("a").unwrap().unwrap();

        db.save_resolved(&local.rev_id, &remote, Resolution::Remote)
            .unwrap();
        let stored = db.current_revision("a").unwrap().unwrap();
        assert_eq!(stored.rev_id, remote.rev_id);
        assert!(stored.history.contains(&local.rev_id));
    }

    #[test]
    fn unsynced_revisions_follow_checkpoint() {
        let db = create_db();
        db.save(&doc("a", 1)).unwrap();
        db.save(&doc("b", 1)).unwrap();
        assert_eq!(db.unsynced_revisions("cp").unwrap().len(), 2);

        let a = db.current_revision("a").unwrap().unwrap();
        db.update_checkpoint("cp", |cp| cp.mark_known("a", a.rev_id.clone()))
            .unwrap();
        let pending = db.unsynced_revisions("cp").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].doc_id, "b");
        assert!(db.unsynced_revision("cp", "a").unwrap().is_none());

        db.save(&doc("a", 2)).unwrap();
        assert!(db.unsynced_revision("cp", "a").unwrap().is_some());

        db.reset_checkpoint("cp").unwrap();
        assert_eq!(db.checkpoint("cp").unwrap(), Checkpoint::default());
    }

    #[test]
    fn peer_checkpoints() {
        let db = create_db();
        assert_eq!(db.peer_checkpoint("client").unwrap(), None);
        db.set_peer_checkpoint("client", 42).unwrap();
        assert_eq!(db.peer_checkpoint("client").unwrap(), Some(42));
    }

    #[test]
    fn closed_database_rejects_operations() {
        let db = create_db();
        db.close().unwrap();
        assert!(!db.is_open());
        assert!(matches!(db.get("a"), Err(StoreError::DatabaseClosed)));
        assert!(matches!(
            db.save(&doc("a", 1)),
            Err(StoreError::DatabaseClosed)
        ));
        // Closing twice is fine.
        db.close().unwrap();
    }

    #[test]
    fn invalid_ids_rejected() {
        let db = create_db();
        assert!(matches!(
            db.save(&Document::new("")),
            Err(StoreError::InvalidDocumentId { .. })
        ));
    }
}
