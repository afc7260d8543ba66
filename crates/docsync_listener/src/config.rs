//! Listener configuration.

use docsync_store::Database;
use docsync_tls::{Authenticator, IdentityStore, TlsIdentity};
use std::fmt;
use std::sync::Arc;

/// Configuration for a [`UrlEndpointListener`](crate::UrlEndpointListener).
///
/// The listener keeps its own copy; changing a configuration after
/// creating a listener from it has no effect on that listener.
#[derive(Clone)]
pub struct ListenerConfiguration {
    /// Database served to connecting replicators.
    pub database: Arc<Database>,
    /// Port to bind. None or 0 picks an ephemeral port.
    pub port: Option<u16>,
    /// Interface to bind: an IP address, an interface name such as `eth0`,
    /// or a host name. None binds all interfaces.
    pub network_interface: Option<String>,
    /// Serve plain TCP instead of TLS.
    pub disable_tls: bool,
    /// Server identity. None uses the database's anonymous identity.
    pub tls_identity: Option<TlsIdentity>,
    /// Store holding anonymous identities. None keeps them in memory for
    /// the lifetime of the listener.
    pub identity_store: Option<Arc<IdentityStore>>,
    /// Password or client certificate check. Must be a listener-side
    /// variant or `None`.
    pub authenticator: Authenticator,
    /// Reject pushes; pulls are still served.
    pub read_only: bool,
    /// Advertise delta sync support.
    pub enable_delta_sync: bool,
}

impl ListenerConfiguration {
    /// Creates a TLS configuration with an ephemeral port on all interfaces.
    pub fn new(database: Arc<Database>) -> Self {
        Self {
            database,
            port: None,
            network_interface: None,
            disable_tls: false,
            tls_identity: None,
            identity_store: None,
            authenticator: Authenticator::None,
            read_only: false,
            enable_delta_sync: false,
        }
    }

    /// Sets the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Binds a single interface, given as an address or host name.
    #[must_use]
    pub fn with_network_interface(mut self, interface: impl Into<String>) -> Self {
        self.network_interface = Some(interface.into());
        self
    }

    /// Disables TLS.
    #[must_use]
    pub fn with_disable_tls(mut self, disable: bool) -> Self {
        self.disable_tls = disable;
        self
    }

    /// Sets the server identity.
    #[must_use]
    pub fn with_tls_identity(mut self, identity: TlsIdentity) -> Self {
        self.tls_identity = Some(identity);
        self
    }

    /// Sets the store used for anonymous identities.
    #[must_use]
    pub fn with_identity_store(mut self, store: Arc<IdentityStore>) -> Self {
        self.identity_store = Some(store);
        self
    }

    /// Sets the authenticator.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Makes the listener read-only.
    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Enables delta sync.
    #[must_use]
    pub fn with_delta_sync(mut self, enabled: bool) -> Self {
        self.enable_delta_sync = enabled;
        self
    }
}

impl fmt::Debug for ListenerConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfiguration")
            .field("database", &self.database.name())
            .field("port", &self.port)
            .field("network_interface", &self.network_interface)
            .field("disable_tls", &self.disable_tls)
            .field("tls_identity", &self.tls_identity)
            .field("authenticator", &self.authenticator)
            .field("read_only", &self.read_only)
            .field("enable_delta_sync", &self.enable_delta_sync)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database() -> Arc<Database> {
        Arc::new(Database::open_in_memory("config").unwrap())
    }

    #[test]
    fn defaults() {
        let config = ListenerConfiguration::new(database());
        assert_eq!(config.port, None);
        assert!(config.network_interface.is_none());
        assert!(!config.disable_tls);
        assert!(!config.read_only);
        assert!(matches!(config.authenticator, Authenticator::None));
    }

    #[test]
    fn builder_pattern() {
        let config = ListenerConfiguration::new(database())
            .with_port(5984)
            .with_network_interface("127.0.0.1")
            .with_disable_tls(true)
            .with_read_only(true)
            .with_delta_sync(true)
            .with_authenticator(Authenticator::password(|_, _| true));

        assert_eq!(config.port, Some(5984));
        assert_eq!(config.network_interface.as_deref(), Some("127.0.0.1"));
        assert!(config.disable_tls);
        assert!(config.read_only);
        assert!(config.enable_delta_sync);
        assert!(config.authenticator.is_listener_side());
    }

    #[test]
    fn copies_are_independent() {
        let original = ListenerConfiguration::new(database()).with_port(1);
        let copy = original.clone().with_port(2);
        assert_eq!(original.port, Some(1));
        assert_eq!(copy.port, Some(2));
        assert!(Arc::ptr_eq(&original.database, &copy.database));
    }
}
