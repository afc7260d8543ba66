//! User-facing document type.

use crate::error::{StoreError, StoreResult};
use crate::revision::{Revision, RevisionId};
use serde_json::{Map, Value};

/// Maximum length of a document ID in bytes.
pub const MAX_DOCUMENT_ID_LEN: usize = 1024;

/// How a save treats a document that changed since it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyControl {
    /// Overwrite whatever revision is current.
    #[default]
    LastWriteWins,
    /// Fail with [`StoreError::Conflict`] if the current revision differs
    /// from the one the document was read at.
    FailOnConflict,
}

/// A JSON document with an optional current revision.
///
/// A document obtained from [`Database::get`](crate::Database::get) remembers
/// the revision it was read at; a freshly constructed one has none.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    id: String,
    revision: Option<RevisionId>,
    sequence: u64,
    deleted: bool,
    properties: Map<String, Value>,
}

impl Document {
    /// Creates an empty, unsaved document.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_properties(id, Map::new())
    }

    /// Creates an unsaved document with the given properties.
    pub fn with_properties(id: impl Into<String>, properties: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            revision: None,
            sequence: 0,
            deleted: false,
            properties,
        }
    }

    /// Creates an unsaved document from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not a JSON object.
    pub fn from_json(id: impl Into<String>, value: Value) -> StoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Self::with_properties(id, map)),
            other => Err(StoreError::invalid_operation(format!(
                "document body must be a JSON object, got {other}"
            ))),
        }
    }

    /// Creates a document view of a stored or replicated revision.
    pub fn from_revision(revision: &Revision) -> Self {
        Self {
            id: revision.doc_id.clone(),
            revision: Some(revision.rev_id.clone()),
            sequence: revision.sequence,
            deleted: revision.deleted,
            properties: revision.body.clone(),
        }
    }

    /// Creates a tombstone placeholder used when resolving in favour of deletion.
    pub fn tombstone(id: impl Into<String>) -> Self {
        Self {
            deleted: true,
            ..Self::new(id)
        }
    }

    /// Sets a property, builder style.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Returns the document ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the revision this document was read at, if any.
    pub fn revision(&self) -> Option<&RevisionId> {
        self.revision.as_ref()
    }

    /// Returns the local sequence of the revision (0 if unsaved).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns true if this is a deletion tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Returns the document properties.
    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    /// Returns the document properties mutably.
    pub fn properties_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.properties
    }

    /// Returns a property value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Returns a string property.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    /// Sets a property.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Removes a property, returning its old value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    /// Returns the properties as a JSON value.
    pub fn to_json(&self) -> Value {
        Value::Object(self.properties.clone())
    }
}

/// Validates a document ID.
pub(crate) fn validate_id(id: &str) -> StoreResult<()> {
    if id.is_empty() {
        return Err(StoreError::InvalidDocumentId {
            message: "document id must not be empty".into(),
        });
    }
    if id.len() > MAX_DOCUMENT_ID_LEN {
        return Err(StoreError::InvalidDocumentId {
            message: format!("document id exceeds {MAX_DOCUMENT_ID_LEN} bytes"),
        });
    }
    Ok(())
}
