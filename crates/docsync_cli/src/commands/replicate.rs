//! Replicate command implementation.

use crate::Direction;
use docsync_replicator::{
    Endpoint, ReplicationDirection, Replicator, ReplicatorConfiguration, ReplicatorType,
};
use docsync_store::Database;
use docsync_tls::{Authenticator, CertificateDer, IdentityStore};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Options of the replicate command.
#[derive(Debug)]
pub struct ReplicateOptions {
    /// Listener URL.
    pub url: String,
    /// Direction.
    pub direction: Direction,
    /// Keep running until interrupted.
    pub continuous: bool,
    /// Basic credentials.
    pub credentials: Option<(String, String)>,
    /// PEM file with the pinned server certificate.
    pub pin: Option<PathBuf>,
    /// Accept any self-signed server certificate.
    pub self_signed: bool,
    /// Identity store directory and label of the client identity.
    pub client_identity: Option<(PathBuf, String)>,
    /// Reset the checkpoint before starting.
    pub reset: bool,
}

impl From<Direction> for ReplicatorType {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Push => ReplicatorType::Push,
            Direction::Pull => ReplicatorType::Pull,
            Direction::PushAndPull => ReplicatorType::PushAndPull,
        }
    }
}

/// Runs the replicate command until the replication stops or Ctrl-C.
pub async fn run(path: &Path, options: ReplicateOptions) -> Result<(), Box<dyn std::error::Error>> {
    let db = Arc::new(Database::open(path)?);

    let mut config = ReplicatorConfiguration::new(Arc::clone(&db), Endpoint::url(&options.url)?)
        .with_type(options.direction.into())
        .with_continuous(options.continuous)
        .with_accept_only_self_signed_server_certificate(options.self_signed);
    if let Some(pem) = &options.pin {
        config = config.with_pinned_server_certificate(read_certificate(pem)?);
    }
    if let Some((username, password)) = options.credentials {
        config = config.with_authenticator(Authenticator::basic(username, password));
    }
    if let Some((dir, label)) = &options.client_identity {
        let identity = IdentityStore::open(dir)?
            .identity(label)?
            .ok_or_else(|| format!("No identity labelled {label:?} in {}", dir.display()))?;
        config = config.with_authenticator(Authenticator::client_certificate(identity));
    }

    let replicator = Replicator::new(config)?;
    replicator.add_change_listener(|status| {
        tracing::info!(
            activity = ?status.activity,
            completed = status.progress.completed,
            total = status.progress.total,
            "replication status"
        );
    });
    replicator.add_document_listener(|replication| {
        let direction = match replication.direction {
            ReplicationDirection::Push => "pushed",
            ReplicationDirection::Pull => "pulled",
        };
        for doc in &replication.documents {
            match &doc.error {
                Some(e) => tracing::warn!(doc_id = %doc.id, error = %e, "{direction} with error"),
                None => tracing::debug!(doc_id = %doc.id, deleted = doc.flags.deleted, "{direction}"),
            }
        }
    });
    replicator.start_with_reset(options.reset);

    tokio::select! {
        _ = replicator.wait_stopped() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("Stopping...");
            replicator.stop();
            replicator.wait_stopped().await;
        }
    }

    let status = replicator.status();
    if let Some(certificate) = replicator.server_certificate() {
        tracing::debug!(bytes = certificate.len(), "server certificate seen");
    }
    tokio::task::spawn_blocking(move || db.close()).await??;

    match status.error {
        Some(e) => Err(format!("Replication failed: {e}").into()),
        None => {
            println!(
                "Replication finished: {} pushed, {} pulled",
                status.push_progress.completed, status.pull_progress.completed
            );
            Ok(())
        }
    }
}

fn read_certificate(path: &Path) -> Result<CertificateDer<'static>, Box<dyn std::error::Error>> {
    let mut reader = BufReader::new(File::open(path)?);
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| format!("No certificate in {}", path.display()))??;
    Ok(cert)
}
