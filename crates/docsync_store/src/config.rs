//! Database configuration.

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to error if the database already exists.
    pub error_if_exists: bool,

    /// Number of ancestor revision IDs kept per document.
    ///
    /// Ancestors are how an incoming revision is classified as a
    /// fast-forward, an already-known revision or a conflict.
    pub max_revision_history: usize,

    /// Whether to fsync the snapshot on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Format version to use for new databases.
    pub format_version: (u16, u16),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            max_revision_history: 20,
            sync_on_commit: true,
            format_version: (1, 0),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to error if database exists.
    #[must_use]
    pub const fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets the per-document ancestor history depth.
    #[must_use]
    pub const fn max_revision_history(mut self, depth: usize) -> Self {
        self.max_revision_history = depth;
        self
    }

    /// Sets whether to sync the snapshot on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }
}
