//! # docsync listener
//!
//! Network listener that lets remote replicators sync with a local database.
//!
//! This crate provides:
//! - `UrlEndpointListener` - binds a port and serves replication sessions
//! - `ListenerConfiguration` - port, interface, TLS identity, authentication
//!   and read-only mode
//! - `ListenerStatus` - open and active connection counts
//!
//! ## Architecture
//!
//! `start()` binds synchronously, then hands the socket to an accept loop
//! on the tokio runtime. Every accepted socket gets its own task which
//! completes the TLS handshake (checking client certificates when a
//! certificate authenticator is set) and then runs the passive replication
//! session from `docsync_replicator`, which checks Basic credentials and
//! enforces read-only mode.
//!
//! Without a configured identity the listener uses an anonymous
//! self-signed identity kept per database in an `IdentityStore`.
//!
//! ## Key Invariants
//!
//! - `active_connection_count <= connection_count` in every status snapshot
//! - A connection counts as active once, from an accepted handshake until
//!   its session ends or its socket closes
//! - `stop()` is idempotent and releases the port; peers see "going away"
//! - A failed `start()` leaves the listener stopped and restartable

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod listener;
mod status;
mod urls;

pub use config::ListenerConfiguration;
pub use error::{ListenerError, ListenerResult};
pub use listener::UrlEndpointListener;
pub use status::ListenerStatus;
