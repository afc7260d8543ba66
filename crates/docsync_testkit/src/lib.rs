//! # docsync testkit
//!
//! Test utilities for docsync.
//!
//! This crate provides:
//! - Temporary in-memory and on-disk databases
//! - Document and identity fixtures
//! - Property-based generators for documents
//! - Async polling helpers for background state (status, counters)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docsync_testkit::prelude::*;
//!
//! #[tokio::test(flavor = "multi_thread")]
//! async fn replicates() {
//!     let source = TestDatabase::memory("source");
//!     populate(&source, "doc", 10);
//!     // ... start a replicator, then:
//!     wait_until(DEFAULT_WAIT, || target.document_count() == 10).await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod identities;
pub mod wait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::identities::*;
    pub use crate::wait::*;
}

pub use fixtures::*;
pub use generators::*;
pub use identities::*;
pub use wait::*;
