//! Persistence and lifecycle tests for the document store.

use docsync_store::{ActiveResource, Config, Database, Document, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tempfile::tempdir;

#[test]
fn documents_and_checkpoints_survive_reopen() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("people");

    let (uuid, rev) = {
        let db = Database::open(&path).unwrap();
        assert_eq!(db.name(), "people");
        let saved = db
            .save(&Document::new("alice").with_value("age", 30))
            .unwrap();
        db.update_checkpoint("cp-1", |cp| cp.pull_sequence = 7)
            .unwrap();
        db.set_peer_checkpoint("peer", 3).unwrap();
        db.close().unwrap();
        (db.uuid(), saved.revision().cloned())
    };

    let db = Database::open(&path).unwrap();
    assert_eq!(db.uuid(), uuid);
    let alice = db.get("alice").unwrap().unwrap();
    assert_eq!(alice.revision().cloned(), rev);
    assert_eq!(db.checkpoint("cp-1").unwrap().pull_sequence, 7);
    assert_eq!(db.peer_checkpoint("peer").unwrap(), Some(3));
    assert_eq!(db.last_sequence(), 1);
}

#[test]
fn second_open_is_locked() {
    let temp = tempdir().unwrap();
    let db = Database::open(temp.path()).unwrap();
    assert!(matches!(
        Database::open(temp.path()),
        Err(StoreError::DatabaseLocked)
    ));
    drop(db);
}

#[test]
fn error_if_exists() {
    let temp = tempdir().unwrap();
    drop(Database::open(temp.path()).unwrap());
    let result = Database::open_with_config(temp.path(), Config::new().error_if_exists(true));
    assert!(matches!(result, Err(StoreError::InvalidFormat { .. })));
}

#[test]
fn delete_removes_files() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("doomed");
    let db = Database::open(&path).unwrap();
    db.save(&Document::new("x")).unwrap();
    db.delete().unwrap();
    assert!(!path.exists());
    assert!(!db.is_open());
}

struct Flag {
    stopped: AtomicBool,
}

impl ActiveResource for Flag {
    fn stop_and_wait(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[test]
fn close_stops_registered_resources() {
    let db = Database::open_in_memory("db").unwrap();
    let flag = Arc::new(Flag {
        stopped: AtomicBool::new(false),
    });
    let resource: Arc<dyn ActiveResource> = flag.clone();
    let weak: Weak<dyn ActiveResource> = Arc::downgrade(&resource);
    db.register_active_resource(weak.clone()).unwrap();
    assert_eq!(db.active_resource_count(), 1);

    db.close().unwrap();
    assert!(flag.stopped.load(Ordering::SeqCst));
    assert_eq!(db.active_resource_count(), 0);
    assert!(matches!(
        db.register_active_resource(weak),
        Err(StoreError::DatabaseClosed)
    ));
}
