//! The URL endpoint listener.

use crate::config::ListenerConfiguration;
use crate::error::{ListenerError, ListenerResult};
use crate::status::{ConnectionCounters, ListenerStatus};
use crate::urls::{bind_address, listener_urls};
use docsync_protocol::{BoxStream, Connection};
use docsync_replicator::{
    serve_passive, shutdown_requested, EndpointUrl, PassiveExit, PassiveOptions, SyncWait, TaskGate,
    TaskGuard,
};
use docsync_store::{ActiveResource, Database, ResourceToken};
use docsync_tls::{server_config, Authenticator, IdentityStore, TlsIdentity};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

/// Time a client has to complete the TLS handshake.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long closing a database waits for a listener's connections to end.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// State of a started listener.
struct Running {
    address: SocketAddr,
    urls: Vec<EndpointUrl>,
    identity: Option<TlsIdentity>,
    shutdown: watch::Sender<bool>,
    token: ResourceToken,
}

/// Everything a connection task needs.
struct ConnectionContext {
    database: Arc<Database>,
    options: PassiveOptions,
    acceptor: Option<TlsAcceptor>,
    counters: Arc<ConnectionCounters>,
}

struct Inner {
    config: ListenerConfiguration,
    identities: Arc<IdentityStore>,
    counters: Arc<ConnectionCounters>,
    running: Mutex<Option<Running>>,
    gate: TaskGate,
    handle: Handle,
}

impl Inner {
    fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.shutdown.send_replace(true);
        self.config.database.unregister_active_resource(running.token);
        tracing::info!(address = %running.address, "listener stopping");
    }
}

impl ActiveResource for Inner {
    fn stop_and_wait(&self) {
        self.stop();
        match self.gate.wait_from_sync(STOP_TIMEOUT) {
            SyncWait::Drained => {}
            SyncWait::TimedOut => {
                tracing::warn!(database = self.config.database.name(), "listener did not stop in time");
            }
            // Already unregistered and reporting stopped; the accept loop
            // and connections close when the runtime next polls them.
            SyncWait::WouldDeadlock => {
                tracing::debug!(database = self.config.database.name(), "listener tasks left to wind down");
            }
        }
    }

    fn describe(&self) -> String {
        format!("listener for {}", self.config.database.name())
    }
}

/// Accepts replication connections for one database.
///
/// # Example
///
/// ```rust,ignore
/// let config = ListenerConfiguration::new(db)
///     .with_port(4984)
///     .with_authenticator(Authenticator::password(|u, p| u == "daniel" && p == "123"));
/// let listener = UrlEndpointListener::new(config)?;
/// listener.start()?;
/// println!("serving at {:?}", listener.urls());
/// ```
///
/// Each accepted connection runs a passive replication session on its own
/// task. Once started, the database holds a weak reference to the listener
/// and stops it when the database closes.
pub struct UrlEndpointListener {
    inner: Arc<Inner>,
}

impl UrlEndpointListener {
    /// Creates a listener on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` outside a runtime, for replicator-side
    /// authenticators, or for a certificate authenticator without TLS.
    pub fn new(config: ListenerConfiguration) -> ListenerResult<Self> {
        let handle = Handle::try_current().map_err(|_| {
            ListenerError::InvalidConfiguration("listeners need a tokio runtime".into())
        })?;
        Self::with_handle(config, handle)
    }

    /// Creates a listener whose tasks run on `handle`.
    pub fn with_handle(config: ListenerConfiguration, handle: Handle) -> ListenerResult<Self> {
        if config.authenticator.is_replicator_side() {
            return Err(ListenerError::InvalidConfiguration(
                "replicator credentials cannot be used by a listener".into(),
            ));
        }
        if config.disable_tls && matches!(config.authenticator, Authenticator::Certificate(_)) {
            return Err(ListenerError::InvalidConfiguration(
                "client certificate authentication requires TLS".into(),
            ));
        }

        let identities = config
            .identity_store
            .clone()
            .unwrap_or_else(|| Arc::new(IdentityStore::in_memory()));
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                identities,
                counters: Arc::new(ConnectionCounters::default()),
                running: Mutex::new(None),
                gate: TaskGate::new(),
                handle,
            }),
        })
    }

    /// Returns the listener's copy of its configuration.
    pub fn config(&self) -> &ListenerConfiguration {
        &self.inner.config
    }

    /// Binds the configured port and starts accepting connections. No-op if
    /// already started.
    ///
    /// # Errors
    ///
    /// - `AddressInUse` if the port is taken
    /// - `Tls` if the identity cannot be resolved or generated
    /// - `Database` if the database is closed
    ///
    /// On error the listener stays stopped and may be started again.
    pub fn start(&self) -> ListenerResult<()> {
        let inner = &self.inner;
        let mut running = inner.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let config = &inner.config;

        let identity = if config.disable_tls {
            None
        } else {
            Some(self.resolve_identity()?)
        };
        let acceptor = match &identity {
            Some(identity) => {
                let validator = match &config.authenticator {
                    Authenticator::Certificate(validator) => Some(validator.clone()),
                    _ => None,
                };
                Some(TlsAcceptor::from(server_config(identity, validator)?))
            }
            None => None,
        };

        let requested = bind_address(config.network_interface.as_deref(), config.port.unwrap_or(0))?;
        let listener = bind(requested, &inner.handle)?;
        let address = listener.local_addr()?;

        let weak: Weak<Inner> = Arc::downgrade(inner);
        let token = config.database.register_active_resource(weak)?;

        let urls = listener_urls(address, identity.is_some(), config.database.name());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let context = Arc::new(ConnectionContext {
            database: Arc::clone(&config.database),
            options: PassiveOptions {
                read_only: config.read_only,
                authenticator: config.authenticator.clone(),
                delta_sync: config.enable_delta_sync,
                ..PassiveOptions::default()
            },
            acceptor,
            counters: Arc::clone(&inner.counters),
        });

        let guard = inner.gate.enter();
        inner.handle.spawn(accept_loop(
            listener,
            context,
            shutdown_rx,
            inner.gate.clone(),
            guard,
        ));
        tracing::info!(
            %address,
            tls = identity.is_some(),
            read_only = config.read_only,
            database = config.database.name(),
            "listener started"
        );

        *running = Some(Running {
            address,
            urls,
            identity,
            shutdown,
            token,
        });
        Ok(())
    }

    fn resolve_identity(&self) -> ListenerResult<TlsIdentity> {
        let config = &self.inner.config;
        if let Some(identity) = &config.tls_identity {
            return Ok(identity.clone());
        }
        let key = config.database.uuid().to_string();
        Ok(self.inner.identities.anonymous_identity(&key)?)
    }

    /// Stops accepting, closes every connection and releases the port.
    /// Peers see a "going away" close. Returns immediately; use
    /// [`wait_stopped`](Self::wait_stopped) to wait for connections to end.
    /// No-op if not started.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Waits until the accept loop and every connection task have exited.
    pub async fn wait_stopped(&self) {
        self.inner.gate.wait().await;
    }

    /// Returns true between a successful `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Returns the bound port while started.
    pub fn port(&self) -> Option<u16> {
        self.inner.running.lock().as_ref().map(|r| r.address.port())
    }

    /// Returns the URLs replicators can use to reach this listener while
    /// started. Link-local addresses are never advertised.
    pub fn urls(&self) -> Option<Vec<EndpointUrl>> {
        self.inner.running.lock().as_ref().map(|r| r.urls.clone())
    }

    /// Returns the identity presented to clients while started with TLS.
    pub fn tls_identity(&self) -> Option<TlsIdentity> {
        self.inner
            .running
            .lock()
            .as_ref()
            .and_then(|r| r.identity.clone())
    }

    /// Returns the current connection counts.
    pub fn status(&self) -> ListenerStatus {
        self.inner.counters.snapshot()
    }

    /// Deletes the auto-generated identities in this listener's identity
    /// store. Returns how many were removed. A running listener keeps using
    /// the identity it started with.
    pub fn delete_anonymous_identities(&self) -> ListenerResult<usize> {
        Ok(self.inner.identities.delete_anonymous_identities()?)
    }
}

impl Drop for UrlEndpointListener {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl std::fmt::Debug for UrlEndpointListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlEndpointListener")
            .field("database", &self.inner.config.database.name())
            .field("port", &self.port())
            .field("status", &self.status())
            .finish()
    }
}

/// Binds synchronously so `start` can report `AddressInUse` directly.
fn bind(address: SocketAddr, handle: &Handle) -> ListenerResult<TcpListener> {
    let std_listener = std::net::TcpListener::bind(address)
        .map_err(|e| ListenerError::from_bind(e, &address.to_string()))?;
    std_listener.set_nonblocking(true)?;
    let _runtime = handle.enter();
    Ok(TcpListener::from_std(std_listener)?)
}

// ============================================================================
// Connection handling
// ============================================================================

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    mut shutdown: watch::Receiver<bool>,
    gate: TaskGate,
    _guard: TaskGuard,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let task = gate.enter();
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&context),
                        shutdown.clone(),
                        task,
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    tracing::debug!("accept loop finished");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<ConnectionContext>,
    mut shutdown: watch::Receiver<bool>,
    _task: TaskGuard,
) {
    let connection = context.counters.open();
    let _ = stream.set_nodelay(true);
    tracing::debug!(%peer, "connection accepted");

    let stream: BoxStream = match &context.acceptor {
        Some(acceptor) => {
            let handshake = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream));
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => return,
                result = handshake => match result {
                    Ok(Ok(tls)) => Box::new(tls),
                    Ok(Err(e)) => {
                        tracing::info!(%peer, error = %e, "TLS handshake failed");
                        return;
                    }
                    Err(_) => {
                        tracing::info!(%peer, "TLS handshake timed out");
                        return;
                    }
                },
            }
        }
        None => Box::new(stream),
    };

    let exit = serve_passive(
        Connection::new(stream, peer.to_string()),
        Arc::clone(&context.database),
        &context.options,
        shutdown,
        || connection.activate(),
    )
    .await;
    connection.deactivate();

    match exit {
        PassiveExit::Failed(e) => tracing::debug!(%peer, error = %e, "connection failed"),
        PassiveExit::Rejected(code) => tracing::debug!(%peer, %code, "connection rejected"),
        other => tracing::debug!(%peer, exit = ?other, "connection closed"),
    }
}
