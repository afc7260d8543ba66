//! Replication endpoints.

use crate::error::{ReplicationError, ReplicationResult};
use docsync_store::Database;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Port used when a URL does not specify one.
pub const DEFAULT_PORT: u16 = 4984;

/// Address of a remote database: `ws[s]://host[:port]/database`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointUrl {
    tls: bool,
    host: String,
    port: u16,
    database: String,
}

impl EndpointUrl {
    /// Creates a URL from its parts.
    pub fn new(tls: bool, host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            tls,
            host: host.into(),
            port,
            database: database.into(),
        }
    }

    /// Returns true for `wss` URLs.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Returns the host name or address, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the remote database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns `host:port` suitable for connecting.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for EndpointUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "wss" } else { "ws" };
        write!(f, "{scheme}://{}/{}", self.authority(), self.database)
    }
}

impl FromStr for EndpointUrl {
    type Err = ReplicationError;

    fn from_str(s: &str) -> ReplicationResult<Self> {
        let invalid = |why: &str| ReplicationError::InvalidConfiguration(format!("{why}: {s:?}"));

        let (scheme, rest) = s.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let tls = match scheme.to_ascii_lowercase().as_str() {
            "ws" => false,
            "wss" => true,
            _ => return Err(invalid("scheme must be ws or wss")),
        };

        let (authority, path) = rest.split_once('/').ok_or_else(|| invalid("missing database"))?;
        let database = path.trim_end_matches('/');
        if database.is_empty() || database.contains('/') {
            return Err(invalid("path must be a single database name"));
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            let port = match after.strip_prefix(':') {
                Some(p) => Some(p),
                None if after.is_empty() => None,
                None => return Err(invalid("unexpected characters after host")),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid("invalid port"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self::new(tls, host, port, database))
    }
}

/// The peer a replicator talks to.
#[derive(Clone)]
pub enum Endpoint {
    /// A listener reachable over the network.
    Url(EndpointUrl),
    /// Another database in this process.
    Database(Arc<Database>),
}

impl Endpoint {
    /// Parses a `ws://` or `wss://` URL endpoint.
    pub fn url(url: &str) -> ReplicationResult<Self> {
        url.parse().map(Endpoint::Url)
    }

    /// Creates a local database endpoint.
    pub fn database(database: Arc<Database>) -> Self {
        Endpoint::Database(database)
    }

    /// Stable key identifying this endpoint in checkpoint IDs.
    pub fn checkpoint_key(&self) -> String {
        match self {
            Endpoint::Url(url) => url.to_string(),
            Endpoint::Database(db) => format!("local:{}", db.uuid()),
        }
    }

    /// Returns true for network endpoints.
    pub fn is_remote(&self) -> bool {
        matches!(self, Endpoint::Url(_))
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Url(url) => write!(f, "Endpoint::Url({url})"),
            Endpoint::Database(db) => write!(f, "Endpoint::Database({})", db.name()),
        }
    }
}
