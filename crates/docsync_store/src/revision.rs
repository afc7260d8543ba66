//! Revision identifiers and stored revisions.
//!
//! Every save produces a new [`RevisionId`] of the form `<generation>-<digest>`.
//! The generation counts edits since creation and the digest is derived from
//! the parent revision, the deletion flag and the document body. Each stored
//! revision carries a bounded list of ancestor IDs (newest first), which is
//! how an incoming revision is classified against the local one.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Number of hex characters kept from the SHA-256 digest.
const DIGEST_LEN: usize = 32;

/// Identifier of one revision of a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId {
    generation: u64,
    digest: String,
}

impl RevisionId {
    /// Derives the revision ID for a new revision.
    ///
    /// The generation is one past the parent's (or 1 for a first revision).
    pub fn derive(parent: Option<&RevisionId>, deleted: bool, body: &Map<String, Value>) -> Self {
        let generation = parent.map_or(1, |p| p.generation + 1);
        Self::compute(generation, parent.into_iter(), deleted, body)
    }

    /// Derives the ID of a revision that merges two conflicting branches.
    ///
    /// The generation is one past the higher of the two, so the merge sorts
    /// after both of them.
    pub fn derive_merge(
        local: &RevisionId,
        remote: &RevisionId,
        deleted: bool,
        body: &Map<String, Value>,
    ) -> Self {
        let generation = local.generation.max(remote.generation) + 1;
        Self::compute(generation, [remote, local].into_iter(), deleted, body)
    }

    fn compute<'a>(
        generation: u64,
        parents: impl Iterator<Item = &'a RevisionId>,
        deleted: bool,
        body: &Map<String, Value>,
    ) -> Self {
        let mut hasher = Sha256::new();
        for parent in parents {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([u8::from(deleted)]);
        // serde_json maps are key-ordered, so the encoding is canonical.
        if let Ok(encoded) = serde_json::to_vec(body) {
            hasher.update(&encoded);
        }
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(DIGEST_LEN);

        Self { generation, digest }
    }

    /// Returns the generation (number of edits since creation).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the digest part of the ID.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.cmp(&other.digest))
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevisionId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| StoreError::InvalidRevisionId(s.to_string()))?;
        let generation: u64 = generation
            .parse()
            .map_err(|_| StoreError::InvalidRevisionId(s.to_string()))?;
        if generation == 0 || digest.is_empty() {
            return Err(StoreError::InvalidRevisionId(s.to_string()));
        }
        Ok(Self {
            generation,
            digest: digest.to_string(),
        })
    }
}

impl TryFrom<String> for RevisionId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RevisionId> for String {
    fn from(id: RevisionId) -> Self {
        id.to_string()
    }
}

/// A single revision of a document as stored and replicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    /// Document ID.
    pub doc_id: String,
    /// This revision's ID.
    pub rev_id: RevisionId,
    /// Ancestor revision IDs, newest first.
    pub history: Vec<RevisionId>,
    /// Whether this revision is a deletion tombstone.
    pub deleted: bool,
    /// Document body. Empty for tombstones.
    pub body: Map<String, Value>,
    /// Local sequence at which this revision was stored.
    pub sequence: u64,
}

impl Revision {
    /// Returns true if `rev_id` is this revision or one of its ancestors.
    #[must_use]
    pub fn descends_from(&self, rev_id: &RevisionId) -> bool {
        &self.rev_id == rev_id || self.history.contains(rev_id)
    }

    /// Returns this revision's ID followed by its ancestors.
    pub fn lineage(&self) -> impl Iterator<Item = &RevisionId> {
        std::iter::once(&self.rev_id).chain(self.history.iter())
    }
}

/// Merges ancestor chains, keeping first-seen order and dropping duplicates.
pub(crate) fn merge_history<'a>(
    chains: impl IntoIterator<Item = &'a RevisionId>,
    exclude: &RevisionId,
    limit: usize,
) -> Vec<RevisionId> {
    let mut merged: Vec<RevisionId> = Vec::new();
    for rev in chains {
        if rev == exclude || merged.contains(rev) {
            continue;
        }
        merged.push(rev.clone());
        if merged.len() >= limit {
            break;
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn first_revision_is_generation_one() {
        let rev = RevisionId::derive(None, false, &body(json!({"a": 1})));
        assert_eq!(rev.generation(), 1);
        assert_eq!(rev.digest().len(), DIGEST_LEN);
    }

    #[test]
    fn child_increments_generation() {
        let parent = RevisionId::derive(None, false, &body(json!({"a": 1})));
        let child = RevisionId::derive(Some(&parent), false, &body(json!({"a": 2})));
        assert_eq!(child.generation(), 2);
        assert!(child > parent);
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = RevisionId::derive(None, false, &body(json!({"x": "y", "n": 3})));
        let b = RevisionId::derive(None, false, &body(json!({"n": 3, "x": "y"})));
        assert_eq!(a, b);

        let tombstone = RevisionId::derive(None, true, &body(json!({"x": "y", "n": 3})));
        assert_ne!(a, tombstone);
    }

    #[test]
    fn merge_sorts_after_both_parents() {
        let base = RevisionId::derive(None, false, &Map::new());
        let local = RevisionId::derive(Some(&base), false, &body(json!({"v": "l"})));
        let remote_1 = RevisionId::derive(Some(&base), false, &body(json!({"v": "r"})));
        let remote = RevisionId::derive(Some(&remote_1), false, &body(json!({"v": "r2"})));

        let merged = RevisionId::derive_merge(&local, &remote, false, &body(json!({"v": "m"})));
        assert_eq!(merged.generation(), 4);
        assert!(merged > local);
        assert!(merged > remote);
    }

    #[test]
    fn parse_and_display() {
        let rev: RevisionId = "3-abcdef".parse().unwrap();
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.digest(), "abcdef");
        assert_eq!(rev.to_string(), "3-abcdef");

        assert!("abc".parse::<RevisionId>().is_err());
        assert!("0-abc".parse::<RevisionId>().is_err());
        assert!("x-abc".parse::<RevisionId>().is_err());
        assert!("2-".parse::<RevisionId>().is_err());
    }

    #[test]
    fn ordering_uses_generation_then_digest() {
        let a: RevisionId = "2-aaa".parse().unwrap();
        let b: RevisionId = "2-bbb".parse().unwrap();
        let c: RevisionId = "10-000".parse().unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn merge_history_dedups_and_caps() {
        let ids: Vec<RevisionId> = (1..=5)
            .map(|g| format!("{g}-d{g}").parse().unwrap())
            .collect();
        let exclude = ids[4].clone();
        let merged = merge_history(ids.iter().chain(ids.iter()), &exclude, 3);
        assert_eq!(merged, ids[..3].to_vec());
    }

    #[test]
    fn descends_from_checks_lineage() {
        let root = RevisionId::derive(None, false, &Map::new());
        let child = RevisionId::derive(Some(&root), false, &Map::new());
        let rev = Revision {
            doc_id: "doc".into(),
            rev_id: child.clone(),
            history: vec![root.clone()],
            deleted: false,
            body: Map::new(),
            sequence: 2,
        };
        assert!(rev.descends_from(&child));
        assert!(rev.descends_from(&root));
        assert_eq!(rev.lineage().count(), 2);
    }
}
