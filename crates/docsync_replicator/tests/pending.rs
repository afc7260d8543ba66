//! Pending-document tracking against a local database endpoint.

use docsync_replicator::{
    Endpoint, ReplicationError, Replicator, ReplicatorConfiguration, ReplicatorType,
};
use docsync_store::Document;
use docsync_testkit::prelude::*;
use std::collections::BTreeSet;

fn push_config(source: &TestDatabase, target: &TestDatabase) -> ReplicatorConfiguration {
    ReplicatorConfiguration::new(source.arc(), Endpoint::database(target.arc()))
        .with_type(ReplicatorType::Push)
}

async fn run_once(replicator: &Replicator) {
    replicator.start();
    within(DEFAULT_WAIT, replicator.wait_stopped()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pending_ids_are_exact_and_empty_after_push() {
    let source = TestDatabase::memory("source");
    let target = TestDatabase::memory("target");
    let ids: BTreeSet<String> = populate(&source, "doc", 5).into_iter().collect();

    let replicator = Replicator::new(push_config(&source, &target)).unwrap();
    assert_eq!(replicator.pending_document_ids().unwrap(), ids);
    assert!(replicator.is_document_pending("doc-3").unwrap());
    assert!(!replicator.is_document_pending("missing").unwrap());

    run_once(&replicator).await;

    let status = replicator.status();
    assert_eq!(status.error, None);
    assert!(status.push_progress.is_complete());
    assert!(replicator.pending_document_ids().unwrap().is_empty());
    assert!(!replicator.is_document_pending("doc-3").unwrap());
    assert_eq!(target.document_count(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn push_filter_limits_pending_and_transfer() {
    let source = TestDatabase::memory("source");
    let target = TestDatabase::memory("target");
    populate(&source, "doc", 6);

    let evens_only = push_config(&source, &target).with_push_filter(|doc: &Document, _| {
        doc.get("index")
            .and_then(|v| v.as_u64())
            .is_some_and(|i| i % 2 == 0)
    });
    let replicator = Replicator::new(evens_only).unwrap();
    let expected: BTreeSet<String> = ["doc-0", "doc-2", "doc-4"].iter().map(|s| s.to_string()).collect();
    assert_eq!(replicator.pending_document_ids().unwrap(), expected);
    assert!(!replicator.is_document_pending("doc-1").unwrap());

    run_once(&replicator).await;
    assert!(replicator.pending_document_ids().unwrap().is_empty());
    assert_eq!(target.document_count(), 3);
    assert!(target.get("doc-1").unwrap().is_none());

    // Filtered documents were not marked synced: without the filter they
    // are still pending against the same endpoint.
    let unfiltered = Replicator::new(push_config(&source, &target)).unwrap();
    let odd: BTreeSet<String> = ["doc-1", "doc-3", "doc-5"].iter().map(|s| s.to_string()).collect();
    assert_eq!(unfiltered.pending_document_ids().unwrap(), odd);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pending_set_is_recomputed_on_every_query() {
    let source = TestDatabase::memory("source");
    let target = TestDatabase::memory("target");
    populate(&source, "doc", 3);

    let replicator = Replicator::new(push_config(&source, &target)).unwrap();
    run_once(&replicator).await;
    assert!(replicator.pending_document_ids().unwrap().is_empty());

    // Update, delete and create all make documents pending again.
    save_field(&source, "doc-0", "edited", true);
    source.delete_document("doc-1").unwrap();
    save_field(&source, "fresh", "x", 1);
    let expected: BTreeSet<String> = ["doc-0", "doc-1", "fresh"].iter().map(|s| s.to_string()).collect();
    assert_eq!(replicator.pending_document_ids().unwrap(), expected);

    // Purged documents are never pushed, so they stop being pending.
    source.purge_document("fresh").unwrap();
    assert!(!replicator.is_document_pending("fresh").unwrap());

    run_once(&replicator).await;
    assert!(replicator.pending_document_ids().unwrap().is_empty());
    assert!(target.get("doc-1").unwrap().is_none());
    assert_eq!(
        target.get("doc-0").unwrap().unwrap().get("edited"),
        Some(&serde_json::Value::Bool(true))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pull_only_pending_queries_are_unsupported() {
    let source = TestDatabase::memory("source");
    let target = TestDatabase::memory("target");
    populate(&source, "doc", 2);

    let config = ReplicatorConfiguration::new(source.arc(), Endpoint::database(target.arc()))
        .with_type(ReplicatorType::Pull);
    let replicator = Replicator::new(config).unwrap();
    assert!(matches!(
        replicator.pending_document_ids(),
        Err(ReplicationError::Unsupported(_))
    ));
    assert!(matches!(
        replicator.is_document_pending("doc-0"),
        Err(ReplicationError::Unsupported(_))
    ));
}
