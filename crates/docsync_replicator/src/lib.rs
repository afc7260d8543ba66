//! # docsync replicator
//!
//! Active and passive replication for docsync databases.
//!
//! This crate provides:
//! - `Replicator` - the replication state machine
//!   (stopped → connecting → idle/busy → stopped, offline between retries)
//! - Push and pull over one connection, one-shot or continuous
//! - Pending-document queries computed live from the checkpoint
//! - Conflict resolution with a pluggable `ConflictResolver`
//! - Retry with exponential backoff for transient network failures
//! - The passive session shared by listeners and local database endpoints
//!
//! ## Architecture
//!
//! A replicator owns one session task at a time. The task dials the
//! endpoint (TCP, TLS, or an in-process pipe to another database), sends
//! `Hello`, and on `Welcome` runs pull and push side by side in a single
//! `select!` loop. Pulled revisions are applied on a blocking thread so
//! resolvers may take their time.
//!
//! ## Key Invariants
//!
//! - `start()` and `stop()` never block and never return errors
//! - Status transitions reach each listener in order, never concurrently
//! - A pulled revision never overwrites a diverging local one without
//!   going through the resolver
//! - Filtered documents are neither transferred nor marked synced
//! - Authentication and certificate failures are never retried

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod endpoint;
mod error;
mod lifecycle;
mod notify;
mod passive;
mod replicator;
mod resolver;
mod session;
mod status;
mod transport;

pub use config::{
    DocumentFlags, NetworkTimeouts, ReplicationFilter, ReplicatorConfiguration, ReplicatorType,
    RetryConfig,
};
pub use endpoint::{Endpoint, EndpointUrl, DEFAULT_PORT};
pub use error::{ReplicationError, ReplicationResult};
pub use lifecycle::{SyncWait, TaskGate, TaskGuard};
pub use passive::{serve_passive, shutdown_requested, PassiveExit, PassiveOptions};
pub use replicator::Replicator;
pub use resolver::{
    resolve_conflict, Conflict, ConflictResolver, DefaultConflictResolver, MAX_RESOLVE_ATTEMPTS,
};
pub use status::{
    ActivityLevel, DocumentReplication, ListenerToken, Progress, ReplicatedDocument,
    ReplicationDirection, ReplicatorStatus,
};
