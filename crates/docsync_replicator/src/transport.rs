//! Opening connections to replication endpoints.

use crate::config::ReplicatorConfiguration;
use crate::endpoint::{Endpoint, EndpointUrl};
use crate::error::{ReplicationError, ReplicationResult};
use crate::passive::{serve_passive, PassiveOptions};
use docsync_protocol::Connection;
use docsync_store::Database;
use docsync_tls::{client_config, Authenticator, PeerCertificateSlot, ServerTrust};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;

/// Buffer size of the in-process pipe used for local endpoints.
const LOCAL_PIPE_CAPACITY: usize = 256 * 1024;

/// Opens a connection to the configured endpoint.
///
/// TLS peers record their leaf certificate into `seen` during the
/// handshake, even when it is then rejected.
pub(crate) async fn dial(
    config: &ReplicatorConfiguration,
    seen: &PeerCertificateSlot,
) -> ReplicationResult<Connection> {
    match &config.endpoint {
        Endpoint::Url(url) => dial_url(config, url, seen).await,
        Endpoint::Database(target) => Ok(dial_local(Arc::clone(target))),
    }
}

async fn dial_url(
    config: &ReplicatorConfiguration,
    url: &EndpointUrl,
    seen: &PeerCertificateSlot,
) -> ReplicationResult<Connection> {
    let authority = url.authority();
    let timeout = config.timeouts.connect;

    let tcp = with_timeout(timeout, &authority, TcpStream::connect(&authority)).await?;
    let _ = tcp.set_nodelay(true);

    if !url.is_tls() {
        if matches!(config.authenticator, Authenticator::ClientCertificate(_)) {
            tracing::warn!(endpoint = %url, "client certificate ignored on a plain connection");
        }
        return Ok(Connection::new(Box::new(tcp), authority));
    }

    let trust = ServerTrust::from_settings(
        config.pinned_server_certificate.clone(),
        config.accept_only_self_signed_server_certificate,
        config.trusted_root_certificates.clone(),
    );
    let identity = match &config.authenticator {
        Authenticator::ClientCertificate(identity) => Some(identity),
        _ => None,
    };
    let tls_config = client_config(trust, identity, Arc::clone(seen))?;
    let server_name = ServerName::try_from(url.host().to_string()).map_err(|e| {
        ReplicationError::InvalidConfiguration(format!("invalid server name {}: {e}", url.host()))
    })?;

    let connector = TlsConnector::from(tls_config);
    let tls = with_timeout(timeout, &authority, connector.connect(server_name, tcp)).await?;
    tracing::debug!(endpoint = %url, "TLS handshake complete");
    Ok(Connection::new(Box::new(tls), authority))
}

async fn with_timeout<T, F>(timeout: Duration, authority: &str, fut: F) -> ReplicationResult<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ReplicationError::from_io(&e)),
        Err(_) => Err(ReplicationError::NetworkUnreachable(format!(
            "timed out connecting to {authority}"
        ))),
    }
}

/// Connects to a database in the same process through an in-memory pipe
/// served by a passive session.
fn dial_local(target: Arc<Database>) -> Connection {
    let (active, passive) = tokio::io::duplex(LOCAL_PIPE_CAPACITY);
    let peer = format!("local:{}", target.name());
    let server = Connection::new(Box::new(passive), "local replicator");

    tokio::spawn(async move {
        // Never signalled: the session ends when the replicator hangs up.
        let (_never, shutdown) = watch::channel(false);
        let options = PassiveOptions::default();
        let exit = serve_passive(server, target, &options, shutdown, || {}).await;
        tracing::trace!(?exit, "local passive session finished");
    });

    Connection::new(Box::new(active), peer)
}
