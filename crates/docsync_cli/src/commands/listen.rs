//! Listen command implementation.

use docsync_listener::{ListenerConfiguration, UrlEndpointListener};
use docsync_store::Database;
use docsync_tls::{Authenticator, IdentityStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Options of the listen command.
#[derive(Debug)]
pub struct ListenOptions {
    /// Port to bind.
    pub port: Option<u16>,
    /// Interface address to bind.
    pub interface: Option<String>,
    /// Serve TLS.
    pub tls: bool,
    /// Identity store directory.
    pub identities: Option<PathBuf>,
    /// Label of the server identity.
    pub identity: Option<String>,
    /// Required username and password.
    pub credentials: Option<(String, String)>,
    /// Reject pushes.
    pub read_only: bool,
    /// Advertise delta sync.
    pub delta_sync: bool,
}

/// Runs the listen command until Ctrl-C.
pub async fn run(path: &Path, options: ListenOptions) -> Result<(), Box<dyn std::error::Error>> {
    let db = Arc::new(Database::open(path)?);

    let mut config = ListenerConfiguration::new(Arc::clone(&db))
        .with_disable_tls(!options.tls)
        .with_read_only(options.read_only)
        .with_delta_sync(options.delta_sync);
    if let Some(port) = options.port {
        config = config.with_port(port);
    }
    if let Some(interface) = options.interface {
        config = config.with_network_interface(interface);
    }
    if let Some(dir) = &options.identities {
        let store = Arc::new(IdentityStore::open(dir)?);
        if let Some(label) = &options.identity {
            let identity = store
                .identity(label)?
                .ok_or_else(|| format!("No identity labelled {label:?} in {}", dir.display()))?;
            config = config.with_tls_identity(identity);
        }
        config = config.with_identity_store(store);
    }
    if let Some((username, password)) = options.credentials {
        config = config.with_authenticator(Authenticator::password(move |u, p| {
            u == username && p == password
        }));
    }

    let listener = UrlEndpointListener::new(config)?;
    listener.start()?;

    println!("Serving {} ({} documents)", db.name(), db.document_count());
    for url in listener.urls().unwrap_or_default() {
        println!("  {url}");
    }
    if let Some(identity) = listener.tls_identity() {
        println!(
            "  certificate: {} (expires {})",
            identity.common_name().unwrap_or_default(),
            identity.expiration()
        );
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let status = listener.status();
                tracing::info!(
                    connections = status.connection_count,
                    active = status.active_connection_count,
                    "listener status"
                );
            }
        }
    }

    println!("Stopping...");
    listener.stop();
    listener.wait_stopped().await;
    tokio::task::spawn_blocking(move || db.close()).await??;
    Ok(())
}
