//! The replicator: lifecycle, status, listeners and pending documents.

use crate::config::ReplicatorConfiguration;
use crate::endpoint::Endpoint;
use crate::error::{ReplicationError, ReplicationResult};
use crate::lifecycle::{SyncWait, TaskGate, TaskGuard};
use crate::notify::Listeners;
use crate::passive::shutdown_requested;
use crate::session::{passes_filter, run_session};
use crate::status::{ActivityLevel, DocumentReplication, ListenerToken, ReplicatorStatus};
use docsync_store::{checkpoint_id, ActiveResource, ResourceToken};
use docsync_tls::{peer_certificate_slot, CertificateDer, PeerCertificateSlot};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// How long closing a database waits for a replicator to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Events fanned out to listeners.
#[derive(Debug, Clone)]
pub(crate) enum ReplicatorEvent {
    Status(ReplicatorStatus),
    Documents(DocumentReplication),
}

/// State shared between the replicator handle, its session task and the
/// database's active-resource registry.
pub(crate) struct Shared {
    pub(crate) config: ReplicatorConfiguration,
    pub(crate) checkpoint_id: String,
    pub(crate) server_certificate: PeerCertificateSlot,
    status: Mutex<ReplicatorStatus>,
    events: Listeners<ReplicatorEvent>,
    /// Shutdown signal of the running session task, if any.
    run: Mutex<Option<watch::Sender<bool>>>,
    /// Set by `stop()`; the session may no longer change the status.
    stopping: AtomicBool,
    gate: TaskGate,
    handle: Handle,
}

impl Shared {
    pub(crate) fn status(&self) -> ReplicatorStatus {
        self.status.lock().clone()
    }

    /// Status update from the session task. Ignored once a stop has been
    /// requested, so `Stopped` is the only transition after `stop()`.
    pub(crate) fn update_status<F>(&self, f: F)
    where
        F: FnOnce(&mut ReplicatorStatus),
    {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        self.set_status(f);
    }

    /// Applies `f` to the status and notifies listeners if anything changed.
    fn set_status<F>(&self, f: F)
    where
        F: FnOnce(&mut ReplicatorStatus),
    {
        let mut status = self.status.lock();
        let before = status.clone();
        f(&mut status);
        if *status != before {
            if status.activity != before.activity {
                tracing::debug!(from = ?before.activity, to = ?status.activity, "replicator activity");
            }
            // Posted under the lock so listeners see transitions in order.
            self.events.post(&ReplicatorEvent::Status(status.clone()));
        }
    }

    pub(crate) fn post_documents(&self, replication: DocumentReplication) {
        self.events.post(&ReplicatorEvent::Documents(replication));
    }

    fn stop(&self) {
        if let Some(signal) = self.run.lock().as_ref() {
            self.stopping.store(true, Ordering::Release);
            signal.send_replace(true);
        }
    }

    /// Marks the session task finished. No-op if the run was already
    /// detached.
    fn finish(&self, error: Option<ReplicationError>) {
        let mut run = self.run.lock();
        if run.take().is_none() {
            return;
        }
        self.set_status(|s| {
            s.activity = ActivityLevel::Stopped;
            s.error = error;
        });
    }

    /// Reports a stopping run as stopped without waiting for its task. The
    /// task closes its connection and exits the next time it is polled.
    fn detach(&self) {
        let mut run = self.run.lock();
        if run.take().is_none() {
            return;
        }
        self.set_status(|s| {
            s.activity = ActivityLevel::Stopped;
            s.error = None;
        });
        tracing::debug!(endpoint = ?self.config.endpoint, "replicator detached from its session task");
    }
}

impl ActiveResource for Shared {
    fn stop_and_wait(&self) {
        self.stop();
        match self.gate.wait_from_sync(STOP_TIMEOUT) {
            SyncWait::Drained => {}
            SyncWait::TimedOut => {
                tracing::warn!(endpoint = ?self.config.endpoint, "replicator did not stop in time");
            }
            SyncWait::WouldDeadlock => self.detach(),
        }
    }

    fn describe(&self) -> String {
        format!("replicator to {:?}", self.config.endpoint)
    }
}

/// Replicates a local database with an [`Endpoint`].
///
/// # Example
///
/// ```rust,ignore
/// let config = ReplicatorConfiguration::new(db, Endpoint::url("wss://peer:4984/db")?)
///     .with_continuous(true)
///     .with_authenticator(Authenticator::basic("daniel", "123"));
/// let replicator = Replicator::new(config)?;
/// replicator.add_change_listener(|status| println!("{:?}", status.activity));
/// replicator.start();
/// ```
///
/// `start()` and `stop()` return immediately; the session runs on the
/// tokio runtime the replicator was created on. Once started, the local
/// database holds a weak reference and stops the replicator when it closes.
pub struct Replicator {
    shared: Arc<Shared>,
}

impl Replicator {
    /// Creates a replicator on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` outside a runtime or for an invalid
    /// configuration.
    pub fn new(config: ReplicatorConfiguration) -> ReplicationResult<Self> {
        let handle = Handle::try_current().map_err(|_| {
            ReplicationError::InvalidConfiguration("replicators need a tokio runtime".into())
        })?;
        Self::with_handle(config, handle)
    }

    /// Creates a replicator whose session and callbacks run on `handle`.
    pub fn with_handle(config: ReplicatorConfiguration, handle: Handle) -> ReplicationResult<Self> {
        if config.authenticator.is_listener_side() {
            return Err(ReplicationError::InvalidConfiguration(
                "listener authenticators cannot be used by a replicator".into(),
            ));
        }
        if config.batch_size == 0 {
            return Err(ReplicationError::InvalidConfiguration(
                "batch size must be positive".into(),
            ));
        }
        if let Endpoint::Database(target) = &config.endpoint {
            if target.uuid() == config.database.uuid() {
                return Err(ReplicationError::InvalidConfiguration(
                    "a database cannot replicate with itself".into(),
                ));
            }
        }

        let checkpoint_id = checkpoint_id(&config.database.uuid(), &config.endpoint.checkpoint_key());
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                checkpoint_id,
                server_certificate: peer_certificate_slot(),
                status: Mutex::new(ReplicatorStatus::stopped()),
                events: Listeners::new(),
                run: Mutex::new(None),
                stopping: AtomicBool::new(false),
                gate: TaskGate::new(),
                handle,
            }),
        })
    }

    /// Returns the replicator's copy of its configuration.
    pub fn config(&self) -> &ReplicatorConfiguration {
        &self.shared.config
    }

    /// Returns the checkpoint ID used for this database and endpoint.
    pub fn checkpoint_id(&self) -> &str {
        &self.shared.checkpoint_id
    }

    /// Starts replicating. No-op if already running.
    ///
    /// Failures are reported through [`status`](Self::status), never here.
    pub fn start(&self) {
        self.start_with_reset(false);
    }

    /// Starts replicating, optionally forgetting the checkpoint first so
    /// every document is considered again.
    pub fn start_with_reset(&self, reset_checkpoint: bool) {
        let shared = &self.shared;
        let mut run = shared.run.lock();
        if run.is_some() {
            return;
        }
        shared.stopping.store(false, Ordering::Release);

        let db = &shared.config.database;
        if reset_checkpoint {
            if let Err(e) = db.reset_checkpoint(&shared.checkpoint_id) {
                tracing::warn!(error = %e, "failed to reset checkpoint");
            }
        }

        let weak: Weak<Shared> = Arc::downgrade(shared);
        let token = match db.register_active_resource(weak) {
            Ok(token) => token,
            Err(e) => {
                shared.set_status(|s| {
                    *s = ReplicatorStatus::stopped();
                    s.error = Some(e.into());
                });
                return;
            }
        };

        let (signal, shutdown) = watch::channel(false);
        *run = Some(signal);
        *shared.server_certificate.lock() = None;
        shared.set_status(|s| {
            *s = ReplicatorStatus::stopped();
            s.activity = ActivityLevel::Connecting;
        });
        tracing::info!(endpoint = ?shared.config.endpoint, continuous = shared.config.continuous, "starting replicator");

        let guard = shared.gate.enter();
        shared
            .handle
            .spawn(drive(Arc::clone(shared), shutdown, token, guard));
    }

    /// Stops replicating. Returns immediately; watch the status for
    /// `Stopped`. No-op if not running.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Waits until the session task has exited.
    pub async fn wait_stopped(&self) {
        self.shared.gate.wait().await;
    }

    /// Returns the current status.
    pub fn status(&self) -> ReplicatorStatus {
        self.shared.status()
    }

    /// Returns the certificate the server presented in the last TLS
    /// handshake, even if it was rejected. None for local endpoints.
    pub fn server_certificate(&self) -> Option<CertificateDer<'static>> {
        self.shared.server_certificate.lock().clone()
    }

    // ========================================================================
    // Pending documents
    // ========================================================================

    /// Returns the IDs of documents with local changes not yet pushed,
    /// restricted to those the push filter admits.
    ///
    /// Computed from the current database state on every call.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` for pull-only replicators.
    pub fn pending_document_ids(&self) -> ReplicationResult<BTreeSet<String>> {
        self.ensure_push()?;
        let config = &self.shared.config;
        Ok(config
            .database
            .unsynced_revisions(&self.shared.checkpoint_id)?
            .into_iter()
            .filter(|rev| passes_filter(config.push_filter.as_ref(), rev))
            .map(|rev| rev.doc_id)
            .collect())
    }

    /// Returns true if a document has local changes not yet pushed.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` for pull-only replicators.
    pub fn is_document_pending(&self, doc_id: &str) -> ReplicationResult<bool> {
        self.ensure_push()?;
        let config = &self.shared.config;
        Ok(config
            .database
            .unsynced_revision(&self.shared.checkpoint_id, doc_id)?
            .is_some_and(|rev| passes_filter(config.push_filter.as_ref(), &rev)))
    }

    fn ensure_push(&self) -> ReplicationResult<()> {
        if self.shared.config.replicator_type.is_push() {
            Ok(())
        } else {
            Err(ReplicationError::Unsupported(
                "pending documents are only tracked for push replication".into(),
            ))
        }
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Adds a status listener called on the replicator's runtime.
    pub fn add_change_listener<F>(&self, callback: F) -> ListenerToken
    where
        F: Fn(&ReplicatorStatus) + Send + Sync + 'static,
    {
        self.add_change_listener_on(&self.shared.handle, callback)
    }

    /// Adds a status listener called on the given runtime.
    ///
    /// Calls to one listener are ordered and never concurrent.
    pub fn add_change_listener_on<F>(&self, handle: &Handle, callback: F) -> ListenerToken
    where
        F: Fn(&ReplicatorStatus) + Send + Sync + 'static,
    {
        self.shared.events.add(
            handle,
            Box::new(move |event: &ReplicatorEvent| {
                if let ReplicatorEvent::Status(status) = event {
                    callback(status);
                }
            }),
        )
    }

    /// Adds a listener for pushed and pulled documents.
    pub fn add_document_listener<F>(&self, callback: F) -> ListenerToken
    where
        F: Fn(&DocumentReplication) + Send + Sync + 'static,
    {
        self.shared.events.add(
            &self.shared.handle,
            Box::new(move |event: &ReplicatorEvent| {
                if let ReplicatorEvent::Documents(replication) = event {
                    callback(replication);
                }
            }),
        )
    }

    /// Removes a status or document listener. Returns false for unknown
    /// tokens.
    pub fn remove_change_listener(&self, token: ListenerToken) -> bool {
        self.shared.events.remove(token)
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("endpoint", &self.shared.config.endpoint)
            .field("activity", &self.shared.status.lock().activity)
            .finish()
    }
}

/// Session task: runs sessions until done, retrying transient failures.
async fn drive(
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    token: ResourceToken,
    _guard: TaskGuard,
) {
    let continuous = shared.config.continuous;
    let mut failures: u32 = 0;

    let outcome = loop {
        shared.update_status(|s| s.activity = ActivityLevel::Connecting);
        let mut connected = false;
        let error = match run_session(&shared, &mut shutdown, &mut connected).await {
            Ok(()) => break None,
            Err(e) => e,
        };
        if *shutdown.borrow() {
            tracing::debug!(error = %error, "session ended while stopping");
            break None;
        }

        if connected {
            failures = 0;
        }
        failures += 1;
        let retry = &shared.config.retry;
        let may_retry = error.is_retryable(continuous) && (continuous || failures < retry.max_attempts);
        if !may_retry {
            tracing::warn!(error = %error, attempts = failures, "replication failed");
            break Some(error);
        }

        let delay = retry.delay_for_attempt(failures);
        tracing::info!(error = %error, attempt = failures, ?delay, "replication interrupted, retrying");
        // Only continuous replicators go offline; a one-shot stays
        // connecting while it backs off.
        shared.update_status(|s| {
            if continuous {
                s.activity = ActivityLevel::Offline;
            }
            s.error = Some(error);
        });
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break None,
            _ = tokio::time::sleep(delay) => {}
        }
    };

    shared.config.database.unregister_active_resource(token);
    shared.finish(outcome);
    tracing::info!(endpoint = ?shared.config.endpoint, "replicator stopped");
}
