//! Replicator configuration.

use crate::endpoint::Endpoint;
use crate::resolver::ConflictResolver;
use docsync_store::{Database, Document};
use docsync_tls::{Authenticator, CertificateDer};
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Replication direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicatorType {
    /// Send local changes only.
    Push,
    /// Receive remote changes only.
    Pull,
    /// Both directions.
    #[default]
    PushAndPull,
}

impl ReplicatorType {
    /// Returns true if local changes are sent.
    pub fn is_push(self) -> bool {
        matches!(self, ReplicatorType::Push | ReplicatorType::PushAndPull)
    }

    /// Returns true if remote changes are received.
    pub fn is_pull(self) -> bool {
        matches!(self, ReplicatorType::Pull | ReplicatorType::PushAndPull)
    }
}

/// Flags passed to replication filters alongside the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DocumentFlags {
    /// The revision is a deletion tombstone.
    pub deleted: bool,
}

/// Predicate deciding whether a document is transferred.
pub type ReplicationFilter = Arc<dyn Fn(&Document, DocumentFlags) -> bool + Send + Sync>;

/// Retry behaviour after transient network failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum connection attempts for one-shot replicators, including the
    /// first. Continuous replicators retry until stopped.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given attempt limit.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay before retry number `attempt` (0 = first try).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            let jitter = delay * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay + jitter)
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Network timing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkTimeouts {
    /// How long to wait for a TCP connection and TLS handshake.
    pub connect: Duration,
    /// Interval between heartbeats; the connection is considered lost after
    /// two intervals without any message from the peer.
    pub heartbeat: Duration,
}

impl NetworkTimeouts {
    /// Sets the connect timeout.
    #[must_use]
    pub const fn with_connect(mut self, timeout: Duration) -> Self {
        self.connect = timeout;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }
}

impl Default for NetworkTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            heartbeat: Duration::from_secs(300),
        }
    }
}

/// Settings of a [`Replicator`](crate::Replicator).
///
/// The replicator keeps its own copy; changing a configuration afterwards
/// does not affect replicators already built from it.
#[derive(Clone)]
pub struct ReplicatorConfiguration {
    /// Local database.
    pub database: Arc<Database>,
    /// Peer to replicate with.
    pub endpoint: Endpoint,
    /// Direction.
    pub replicator_type: ReplicatorType,
    /// Keep running and stream changes as they happen.
    pub continuous: bool,
    /// Credentials presented to the peer.
    pub authenticator: Authenticator,
    /// Only accept a server presenting exactly this certificate.
    pub pinned_server_certificate: Option<CertificateDer<'static>>,
    /// Accept any self-signed server certificate. Ignored when a pin is set.
    pub accept_only_self_signed_server_certificate: bool,
    /// Trusted roots used when neither pinning nor self-signed mode applies.
    pub trusted_root_certificates: Vec<CertificateDer<'static>>,
    /// Decides which local documents are pushed.
    pub push_filter: Option<ReplicationFilter>,
    /// Decides which remote documents are stored.
    pub pull_filter: Option<ReplicationFilter>,
    /// Settles conflicts. None uses [`DefaultConflictResolver`](crate::DefaultConflictResolver).
    pub conflict_resolver: Option<Arc<dyn ConflictResolver>>,
    /// Extra headers sent in the handshake.
    pub headers: BTreeMap<String, String>,
    /// Network timing.
    pub timeouts: NetworkTimeouts,
    /// Retry behaviour.
    pub retry: RetryConfig,
    /// Maximum revisions per batch.
    pub batch_size: u32,
}

impl ReplicatorConfiguration {
    /// Creates a push-and-pull, one-shot configuration.
    pub fn new(database: Arc<Database>, endpoint: Endpoint) -> Self {
        Self {
            database,
            endpoint,
            replicator_type: ReplicatorType::default(),
            continuous: false,
            authenticator: Authenticator::None,
            pinned_server_certificate: None,
            accept_only_self_signed_server_certificate: false,
            trusted_root_certificates: Vec::new(),
            push_filter: None,
            pull_filter: None,
            conflict_resolver: None,
            headers: BTreeMap::new(),
            timeouts: NetworkTimeouts::default(),
            retry: RetryConfig::default(),
            batch_size: 100,
        }
    }

    /// Sets the direction.
    #[must_use]
    pub fn with_type(mut self, replicator_type: ReplicatorType) -> Self {
        self.replicator_type = replicator_type;
        self
    }

    /// Sets continuous mode.
    #[must_use]
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Sets the authenticator.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Pins the server certificate.
    #[must_use]
    pub fn with_pinned_server_certificate(mut self, cert: CertificateDer<'static>) -> Self {
        self.pinned_server_certificate = Some(cert);
        self
    }

    /// Accepts any self-signed server certificate.
    #[must_use]
    pub fn with_accept_only_self_signed_server_certificate(mut self, accept: bool) -> Self {
        self.accept_only_self_signed_server_certificate = accept;
        self
    }

    /// Sets the trusted root certificates.
    #[must_use]
    pub fn with_trusted_root_certificates(mut self, roots: Vec<CertificateDer<'static>>) -> Self {
        self.trusted_root_certificates = roots;
        self
    }

    /// Sets the push filter.
    #[must_use]
    pub fn with_push_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Document, DocumentFlags) -> bool + Send + Sync + 'static,
    {
        self.push_filter = Some(Arc::new(filter));
        self
    }

    /// Sets the pull filter.
    #[must_use]
    pub fn with_pull_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Document, DocumentFlags) -> bool + Send + Sync + 'static,
    {
        self.pull_filter = Some(Arc::new(filter));
        self
    }

    /// Sets the conflict resolver.
    #[must_use]
    pub fn with_conflict_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.conflict_resolver = Some(resolver);
        self
    }

    /// Adds a handshake header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the network timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: NetworkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the retry behaviour.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

impl fmt::Debug for ReplicatorConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatorConfiguration")
            .field("database", &self.database.name())
            .field("endpoint", &self.endpoint)
            .field("replicator_type", &self.replicator_type)
            .field("continuous", &self.continuous)
            .field("authenticator", &self.authenticator)
            .field("pinned", &self.pinned_server_certificate.is_some())
            .field(
                "self_signed_only",
                &self.accept_only_self_signed_server_certificate,
            )
            .field("push_filter", &self.push_filter.is_some())
            .field("pull_filter", &self.pull_filter.is_some())
            .field("custom_resolver", &self.conflict_resolver.is_some())
            .field("headers", &self.headers)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}
