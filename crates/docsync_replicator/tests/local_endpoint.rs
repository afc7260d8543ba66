//! Replication between two databases in the same process.

use docsync_replicator::{
    ActivityLevel, DocumentReplication, Endpoint, ReplicationDirection, ReplicationError,
    Replicator, ReplicatorConfiguration, ReplicatorStatus, ReplicatorType, RetryConfig,
};
use docsync_testkit::prelude::*;
use docsync_tls::Authenticator;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config(source: &TestDatabase, target: &TestDatabase) -> ReplicatorConfiguration {
    ReplicatorConfiguration::new(source.arc(), Endpoint::database(target.arc()))
}

fn record_statuses(replicator: &Replicator) -> Arc<Mutex<Vec<ReplicatorStatus>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    replicator.add_change_listener(move |status| sink.lock().push(status.clone()));
    seen
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_shot_push_and_pull_merges_both_sides() {
    let a = TestDatabase::memory("a");
    let b = TestDatabase::memory("b");
    populate(&a, "from-a", 4);
    populate(&b, "from-b", 3);

    let replicator = Replicator::new(config(&a, &b)).unwrap();
    let statuses = record_statuses(&replicator);
    replicator.start();
    within(DEFAULT_WAIT, replicator.wait_stopped()).await;

    let status = replicator.status();
    assert_eq!(status.activity, ActivityLevel::Stopped);
    assert_eq!(status.error, None);
    assert_eq!(a.document_count(), 7);
    assert_eq!(contents(&a), contents(&b));
    assert_eq!(replicator.server_certificate(), None);

    wait_until(DEFAULT_WAIT, || {
        statuses
            .lock()
            .last()
            .is_some_and(|s| s.activity == ActivityLevel::Stopped)
    })
    .await;
    let activities: Vec<ActivityLevel> = statuses.lock().iter().map(|s| s.activity).collect();
    assert_eq!(activities.first(), Some(&ActivityLevel::Connecting));
    assert!(activities.contains(&ActivityLevel::Idle));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn continuous_replication_follows_new_changes() {
    let a = TestDatabase::memory("a");
    let b = TestDatabase::memory("b");
    let replicator = Replicator::new(config(&a, &b).with_continuous(true)).unwrap();
    replicator.start();
    wait_until(DEFAULT_WAIT, || replicator.status().activity == ActivityLevel::Idle).await;

    save_field(&a, "pushed", "side", "a");
    save_field(&b, "pulled", "side", "b");
    wait_until(DEFAULT_WAIT, || {
        b.get("pushed").unwrap().is_some() && a.get("pulled").unwrap().is_some()
    })
    .await;

    // Revisions that arrived from the peer are not pushed back.
    wait_until(DEFAULT_WAIT, || replicator.pending_document_ids().unwrap().is_empty()).await;

    replicator.stop();
    within(DEFAULT_WAIT, replicator.wait_stopped()).await;
    assert_eq!(replicator.status().activity, ActivityLevel::Stopped);
    assert_eq!(replicator.status().error, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_is_idempotent_and_silent() {
    let a = TestDatabase::memory("a");
    let b = TestDatabase::memory("b");
    let replicator = Replicator::new(config(&a, &b)).unwrap();
    let statuses = record_statuses(&replicator);

    replicator.stop();
    replicator.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(statuses.lock().is_empty());

    replicator.start();
    within(DEFAULT_WAIT, replicator.wait_stopped()).await;
    wait_until(DEFAULT_WAIT, || {
        statuses
            .lock()
            .last()
            .is_some_and(|s| s.activity == ActivityLevel::Stopped)
    })
    .await;
    let count = statuses.lock().len();

    replicator.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(statuses.lock().len(), count);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_keeps_checkpoint() {
    let a = TestDatabase::memory("a");
    let b = TestDatabase::memory("b");
    populate(&a, "doc", 3);

    let replicator = Replicator::new(config(&a, &b).with_type(ReplicatorType::Push)).unwrap();
    replicator.start();
    within(DEFAULT_WAIT, replicator.wait_stopped()).await;
    assert_eq!(replicator.status().push_progress.completed, 3);

    // Nothing new: a restart transfers nothing and resets progress.
    replicator.start();
    within(DEFAULT_WAIT, replicator.wait_stopped()).await;
    let status = replicator.status();
    assert_eq!(status.error, None);
    assert_eq!(status.push_progress.completed, 0);

    // A reset checkpoint makes every document pending again.
    replicator.start_with_reset(true);
    within(DEFAULT_WAIT, replicator.wait_stopped()).await;
    assert_eq!(replicator.status().push_progress.completed, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn document_listener_reports_directions() {
    let a = TestDatabase::memory("a");
    let b = TestDatabase::memory("b");
    save_field(&a, "up", "x", 1);
    save_field(&b, "down", "x", 2);

    let replicator = Replicator::new(config(&a, &b)).unwrap();
    let events: Arc<Mutex<Vec<DocumentReplication>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    replicator.add_document_listener(move |replication| sink.lock().push(replication.clone()));
    replicator.start();
    within(DEFAULT_WAIT, replicator.wait_stopped()).await;

    let ids_for = |direction: ReplicationDirection| -> Vec<String> {
        events
            .lock()
            .iter()
            .filter(|e| e.direction == direction)
            .flat_map(|e| e.documents.iter().map(|d| d.id.clone()))
            .collect()
    };
    wait_until(DEFAULT_WAIT, || {
        !ids_for(ReplicationDirection::Push).is_empty() && !ids_for(ReplicationDirection::Pull).is_empty()
    })
    .await;
    assert_eq!(ids_for(ReplicationDirection::Push), vec!["up".to_string()]);
    assert_eq!(ids_for(ReplicationDirection::Pull), vec!["down".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removed_listener_is_not_called() {
    let a = TestDatabase::memory("a");
    let b = TestDatabase::memory("b");
    let replicator = Replicator::new(config(&a, &b)).unwrap();
    let statuses = record_statuses(&replicator);
    let removed = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&removed);
    let token = replicator.add_change_listener(move |_| *sink.lock() += 1);
    assert!(replicator.remove_change_listener(token));

    replicator.start();
    within(DEFAULT_WAIT, replicator.wait_stopped()).await;
    wait_until(DEFAULT_WAIT, || {
        statuses
            .lock()
            .last()
            .is_some_and(|s| s.activity == ActivityLevel::Stopped)
    })
    .await;
    assert_eq!(*removed.lock(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closing_the_database_stops_replicators() {
    let a = TestDatabase::memory("a");
    let b = TestDatabase::memory("b");
    let replicator = Replicator::new(config(&a, &b).with_continuous(true)).unwrap();
    replicator.start();
    wait_until(DEFAULT_WAIT, || replicator.status().activity == ActivityLevel::Idle).await;
    assert_eq!(a.active_resource_count(), 1);

    let db = a.arc();
    tokio::task::spawn_blocking(move || db.close()).await.unwrap().unwrap();

    assert_eq!(replicator.status().activity, ActivityLevel::Stopped);
    assert_eq!(a.active_resource_count(), 0);

    // A closed database refuses new replications.
    replicator.start();
    let status = replicator.status();
    assert_eq!(status.activity, ActivityLevel::Stopped);
    assert!(matches!(status.error, Some(ReplicationError::Database(_))));
}

#[tokio::test]
async fn closing_on_a_current_thread_runtime_does_not_hang() {
    let a = TestDatabase::memory("a");
    let b = TestDatabase::memory("b");
    let replicator = Replicator::new(config(&a, &b).with_continuous(true)).unwrap();
    replicator.start();
    wait_until(DEFAULT_WAIT, || replicator.status().activity == ActivityLevel::Idle).await;

    let started = Instant::now();
    a.close().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(replicator.status().activity, ActivityLevel::Stopped);
    assert_eq!(a.active_resource_count(), 0);

    // The session task winds down once the runtime polls it again, without
    // touching the reported status.
    within(DEFAULT_WAIT, replicator.wait_stopped()).await;
    let status = replicator.status();
    assert_eq!(status.activity, ActivityLevel::Stopped);
    assert_eq!(status.error, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pull_filter_rejections_are_offered_again() {
    let a = TestDatabase::memory("a");
    let b = TestDatabase::memory("b");
    save_field(&b, "held", "x", 1);
    save_field(&b, "free", "x", 2);

    let accept_held = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&accept_held);
    let replicator = Replicator::new(
        config(&a, &b)
            .with_type(ReplicatorType::Pull)
            .with_pull_filter(move |doc, _| doc.id() != "held" || gate.load(Ordering::SeqCst)),
    )
    .unwrap();

    replicator.start();
    within(DEFAULT_WAIT, replicator.wait_stopped()).await;
    assert_eq!(replicator.status().error, None);
    assert!(a.get("free").unwrap().is_some());
    assert!(a.get("held").unwrap().is_none());

    // Nothing changed on the peer; the filter now admits the document.
    accept_held.store(true, Ordering::SeqCst);
    replicator.start();
    within(DEFAULT_WAIT, replicator.wait_stopped()).await;
    assert_eq!(replicator.status().error, None);
    assert!(a.get("held").unwrap().is_some());
    assert_eq!(contents(&a), contents(&b));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_shot_retries_without_going_offline() {
    let a = TestDatabase::memory("a");
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let endpoint = Endpoint::url(&format!("ws://127.0.0.1:{port}/nobody")).unwrap();
    let config = ReplicatorConfiguration::new(a.arc(), endpoint).with_retry(
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false),
    );
    let replicator = Replicator::new(config).unwrap();
    let statuses = record_statuses(&replicator);
    replicator.start();
    within(DEFAULT_WAIT, replicator.wait_stopped()).await;

    wait_until(DEFAULT_WAIT, || {
        statuses
            .lock()
            .last()
            .is_some_and(|s| s.activity == ActivityLevel::Stopped)
    })
    .await;
    let mut activities: Vec<ActivityLevel> = statuses.lock().iter().map(|s| s.activity).collect();
    activities.dedup();
    assert_eq!(activities, vec![ActivityLevel::Connecting, ActivityLevel::Stopped]);

    // Retries were attempted: the error was recorded while still connecting.
    assert!(statuses
        .lock()
        .iter()
        .any(|s| s.activity == ActivityLevel::Connecting && s.error.is_some()));
    assert!(matches!(
        replicator.status().error,
        Some(ReplicationError::ConnectionRefused(_))
    ));
}

#[tokio::test]
async fn invalid_configurations_are_rejected() {
    let a = TestDatabase::memory("a");
    let b = TestDatabase::memory("b");

    let to_self = ReplicatorConfiguration::new(a.arc(), Endpoint::database(a.arc()));
    assert!(matches!(
        Replicator::new(to_self),
        Err(ReplicationError::InvalidConfiguration(_))
    ));

    let listener_auth = config(&a, &b).with_authenticator(Authenticator::password(|_, _| true));
    assert!(matches!(
        Replicator::new(listener_auth),
        Err(ReplicationError::InvalidConfiguration(_))
    ));
}
