//! Directory-backed identity store tests.

use docsync_tls::{CertificateAttributes, IdentityStore, KeyUsage, TlsError};
use tempfile::tempdir;

#[test]
fn identities_survive_reopen() {
    let dir = tempdir().unwrap();
    let created = {
        let store = IdentityStore::open(dir.path()).unwrap();
        store
            .create_identity(
                KeyUsage::Server,
                &CertificateAttributes::new("persisted").with_country("TZ"),
                None,
                Some("listener"),
            )
            .unwrap()
    };

    let store = IdentityStore::open(dir.path()).unwrap();
    let loaded = store.identity("listener").unwrap().unwrap();
    assert_eq!(loaded, created);
    assert_eq!(loaded.common_name().as_deref(), Some("persisted"));
    assert_eq!(store.labels().unwrap(), vec!["listener"]);
}

#[test]
fn labels_with_path_characters_are_safe() {
    let dir = tempdir().unwrap();
    let store = IdentityStore::open(dir.path()).unwrap();
    let label = "../evil/label";
    store
        .create_identity(KeyUsage::Client, &CertificateAttributes::new("x"), None, Some(label))
        .unwrap();
    assert_eq!(store.labels().unwrap(), vec![label]);
    store.delete_identity(label).unwrap();
    assert!(store.labels().unwrap().is_empty());
}

#[test]
fn label_must_be_deleted_before_reuse() {
    let dir = tempdir().unwrap();
    let store = IdentityStore::open(dir.path()).unwrap();
    let attrs = CertificateAttributes::new("reuse");
    let first = store
        .create_identity(KeyUsage::Client, &attrs, None, Some("me"))
        .unwrap();
    assert!(matches!(
        store.create_identity(KeyUsage::Client, &attrs, None, Some("me")),
        Err(TlsError::LabelExists(_))
    ));

    store.delete_identity("me").unwrap();
    let second = store
        .create_identity(KeyUsage::Client, &attrs, None, Some("me"))
        .unwrap();
    assert_ne!(first.leaf(), second.leaf());
}

#[test]
fn anonymous_identities_persist_until_purged() {
    let dir = tempdir().unwrap();
    let first = IdentityStore::open(dir.path())
        .unwrap()
        .anonymous_identity("db")
        .unwrap();

    let store = IdentityStore::open(dir.path()).unwrap();
    assert_eq!(store.anonymous_identity("db").unwrap().leaf(), first.leaf());
    assert!(store.labels().unwrap().is_empty());
    assert_eq!(store.delete_anonymous_identities().unwrap(), 1);
    assert_eq!(store.delete_anonymous_identities().unwrap(), 0);
}

#[test]
fn export_requires_existing_label() {
    let store = IdentityStore::in_memory();
    assert!(matches!(
        store.export_identity("missing", "pw"),
        Err(TlsError::IdentityNotFound(_))
    ));
}
