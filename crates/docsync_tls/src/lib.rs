//! # docsync_tls
//!
//! TLS identities, authenticators and certificate verification for docsync.
//!
//! This crate provides:
//! - `TlsIdentity` - a key pair and certificate chain, generated or imported
//! - `IdentityStore` - labelled identity storage, in memory or on disk
//! - `Authenticator` - replicator credentials and listener checks
//! - `ServerTrust` - pinning, self-signed-only and root-based server trust
//! - rustls config builders wiring the above together
//!
//! ## Key Invariants
//!
//! - A pinned certificate is matched byte-for-byte and bypasses chain checks
//! - A pin takes precedence over self-signed-only mode
//! - Storing an identity under a used label fails; deleting a missing one does not
//! - Private keys never appear in `Debug` output

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod authenticator;
pub mod bundle;
mod config;
mod error;
mod identity;
mod store;
mod verify;

pub use authenticator::{
    Authenticator, CertificateCallback, CertificateValidator, PasswordCallback,
};
pub use config::{client_config, server_config};
pub use error::{TlsError, TlsResult};
pub use identity::{is_self_signed, CertificateAttributes, KeyUsage, TlsIdentity, DEFAULT_VALIDITY};
pub use store::IdentityStore;
pub use verify::{
    classify_tls_error, peer_certificate_slot, ClientVerifier, PeerCertificateSlot, ServerTrust,
    ServerVerifier, TlsFailure,
};

/// Re-exported certificate type used throughout the public API.
pub use rustls::pki_types::CertificateDer;
