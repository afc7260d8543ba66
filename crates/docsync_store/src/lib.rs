//! # docsync store
//!
//! Revisioned JSON document store that serves as the local side of
//! docsync replication.
//!
//! This crate provides:
//! - Documents with generation-digest revision IDs and bounded ancestry
//! - Classification of incoming revisions (insert, fast-forward, known, conflict)
//! - Atomic conflict-resolution writes
//! - Per-peer replication checkpoints
//! - A commit-ordered change feed
//! - The registry of active replicators and listeners bound to a database
//!
//! ## Key Invariants
//!
//! - Every committed change gets a strictly increasing sequence number
//! - Conflicting remote revisions are never written without a resolution
//! - Closing a database stops every registered resource first

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod checkpoint;
mod config;
mod database;
mod dir;
mod document;
mod error;
mod registry;
mod revision;

pub use change_feed::{ChangeEvent, ChangeFeed, ChangeOrigin, ChangeType};
pub use checkpoint::{checkpoint_id, Checkpoint};
pub use config::Config;
pub use database::{ApplyOutcome, Database, Resolution};
pub use document::{ConcurrencyControl, Document, MAX_DOCUMENT_ID_LEN};
pub use error::{StoreError, StoreResult};
pub use registry::{ActiveResource, ActiveResourceRegistry, ResourceToken};
pub use revision::{Revision, RevisionId};
