//! Server trust and client certificate authentication.

use docsync_listener::{ListenerConfiguration, UrlEndpointListener};
use docsync_replicator::{
    ActivityLevel, Endpoint, ReplicationError, Replicator, ReplicatorConfiguration, ReplicatorStatus,
};
use docsync_testkit::prelude::*;
use docsync_tls::Authenticator;

fn start_listener(config: ListenerConfiguration) -> UrlEndpointListener {
    let listener =
        UrlEndpointListener::new(config.with_network_interface("127.0.0.1")).unwrap();
    listener.start().unwrap();
    listener
}

fn replicate_to(db: &TestDatabase, listener: &UrlEndpointListener) -> ReplicatorConfiguration {
    let url = listener.urls().unwrap()[0].clone();
    ReplicatorConfiguration::new(db.arc(), Endpoint::Url(url))
}

async fn run_once(config: ReplicatorConfiguration) -> (Replicator, ReplicatorStatus) {
    let replicator = Replicator::new(config).unwrap();
    replicator.start();
    within(DEFAULT_WAIT, replicator.wait_stopped()).await;
    let status = replicator.status();
    assert_eq!(status.activity, ActivityLevel::Stopped);
    (replicator, status)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pinned_mismatch_reports_unknown_root_and_exposes_certificate() {
    let served = TestDatabase::memory("served");
    let client = TestDatabase::memory("client");
    populate(&client, "doc", 2);
    let listener = start_listener(ListenerConfiguration::new(served.arc()));
    let presented = listener.tls_identity().unwrap().leaf().clone();

    let wrong_pin = server_identity("somebody-else").leaf().clone();
    let (replicator, status) =
        run_once(replicate_to(&client, &listener).with_pinned_server_certificate(wrong_pin)).await;

    assert_eq!(status.error, Some(ReplicationError::TlsCertUnknownRoot));
    assert_eq!(replicator.server_certificate(), Some(presented));
    assert_eq!(served.document_count(), 0);
    assert_eq!(listener.status().active_connection_count, 0);
    listener.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn matching_pin_is_trusted() {
    let served = TestDatabase::memory("served");
    let client = TestDatabase::memory("client");
    populate(&client, "doc", 2);
    let listener = start_listener(ListenerConfiguration::new(served.arc()));
    let pin = listener.tls_identity().unwrap().leaf().clone();

    let (_, status) = run_once(
        replicate_to(&client, &listener)
            .with_pinned_server_certificate(pin)
            .with_accept_only_self_signed_server_certificate(true),
    )
    .await;
    assert_eq!(status.error, None);
    assert_eq!(served.document_count(), 2);
    listener.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn untrusted_self_signed_server_is_refused_by_default() {
    let served = TestDatabase::memory("served");
    let client = TestDatabase::memory("client");
    let listener = start_listener(ListenerConfiguration::new(served.arc()));

    let (replicator, status) = run_once(replicate_to(&client, &listener)).await;
    assert_eq!(status.error, Some(ReplicationError::TlsCertUnknownRoot));
    assert!(replicator.server_certificate().is_some());

    // The same certificate is fine once it is a trusted root.
    let root = listener.tls_identity().unwrap().leaf().clone();
    let (_, status) =
        run_once(replicate_to(&client, &listener).with_trusted_root_certificates(vec![root])).await;
    assert_eq!(status.error, None);
    listener.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_certificate_accepted_by_root() {
    let served = TestDatabase::memory("served");
    let client = TestDatabase::memory("client");
    populate(&client, "doc", 3);
    let trusted = client_identity("trusted-client");
    let listener = start_listener(
        ListenerConfiguration::new(served.arc())
            .with_authenticator(Authenticator::certificate_roots(vec![trusted.leaf().clone()])),
    );

    let (_, status) = run_once(
        replicate_to(&client, &listener)
            .with_accept_only_self_signed_server_certificate(true)
            .with_authenticator(Authenticator::client_certificate(trusted)),
    )
    .await;
    assert_eq!(status.error, None);
    assert_eq!(served.document_count(), 3);
    listener.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_certificate_rejected_by_callback() {
    let served = TestDatabase::memory("served");
    let client = TestDatabase::memory("client");
    populate(&client, "doc", 1);
    let listener = start_listener(
        ListenerConfiguration::new(served.arc()).with_authenticator(Authenticator::certificate(
            |chain| {
                chain
                    .first()
                    .is_some_and(|leaf| leaf.as_ref() == b"never matches".as_slice())
            },
        )),
    );

    let (_, status) = run_once(
        replicate_to(&client, &listener)
            .with_accept_only_self_signed_server_certificate(true)
            .with_authenticator(Authenticator::client_certificate(client_identity("stranger"))),
    )
    .await;
    assert_eq!(status.error, Some(ReplicationError::TlsClientCertRejected));
    assert_eq!(served.document_count(), 0);
    wait_until(DEFAULT_WAIT, || listener.status().connection_count == 0).await;
    listener.stop();
}
