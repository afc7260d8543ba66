//! Test fixtures and database helpers.
//!
//! Databases are handed out as `Arc<Database>` because replicators and
//! listeners share them with the test body.

use docsync_store::{Database, Document};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Arc<Database>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates a new in-memory test database.
    pub fn memory(name: &str) -> Self {
        Self {
            db: Arc::new(Database::open_in_memory(name).expect("Failed to open in-memory database")),
            _temp_dir: None,
        }
    }

    /// Creates a new on-disk test database in a temporary directory.
    pub fn file(name: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open(&temp_dir.path().join(name)).expect("Failed to open file database");
        Self {
            db: Arc::new(db),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns another handle to the database.
    pub fn arc(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    /// Returns the database directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.db.path()
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Creates a temporary directory for identity stores and other files.
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Returns `<dir>/<name>`.
pub fn path_in(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

/// Saves `count` documents `<prefix>-<i>` with an `index` field and returns
/// their IDs.
pub fn populate(db: &Database, prefix: &str, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let id = format!("{prefix}-{i}");
            db.save(&Document::new(id.clone()).with_value("index", i))
                .expect("Failed to save document");
            id
        })
        .collect()
}

/// Saves one document with a single field.
pub fn save_field(db: &Database, id: &str, key: &str, value: impl Into<Value>) -> Document {
    let doc = match db.get(id).expect("Failed to read document") {
        Some(existing) => existing.with_value(key, value),
        None => Document::new(id).with_value(key, value),
    };
    db.save(&doc).expect("Failed to save document")
}

/// Returns every live document's properties keyed by ID.
pub fn contents(db: &Database) -> BTreeMap<String, Map<String, Value>> {
    db.document_ids()
        .expect("Failed to list documents")
        .into_iter()
        .filter_map(|id| {
            db.get(&id)
                .expect("Failed to read document")
                .map(|doc| (id, doc.properties().clone()))
        })
        .collect()
}
