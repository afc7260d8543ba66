//! Database directory management.
//!
//! ```text
//! <db_path>/
//! ├─ LOCK              # Advisory lock for single-process access
//! └─ SNAPSHOT          # CBOR snapshot of documents and checkpoints
//! ```
//!
//! The snapshot is rewritten atomically on every commit.

use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const SNAPSHOT_FILE: &str = "SNAPSHOT";
const SNAPSHOT_TEMP: &str = "SNAPSHOT.tmp";

/// Holds the exclusive lock on a database directory.
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates a database directory and locks it.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `DatabaseLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> StoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StoreError::invalid_format(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(StoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if no snapshot has been written yet.
    #[must_use]
    pub fn is_new_database(&self) -> bool {
        !self.path.join(SNAPSHOT_FILE).exists()
    }

    /// Loads the snapshot, or None for a new database.
    pub fn load_snapshot<T: DeserializeOwned>(&self) -> StoreResult<Option<T>> {
        let path = self.path.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        if data.is_empty() {
            return Ok(None);
        }
        let snapshot = ciborium::from_reader(data.as_slice())
            .map_err(|e| StoreError::invalid_format(format!("corrupt snapshot: {e}")))?;
        Ok(Some(snapshot))
    }

    /// Writes the snapshot atomically (write temp, sync, rename, sync dir).
    pub fn save_snapshot<T: Serialize>(&self, snapshot: &T, sync: bool) -> StoreResult<()> {
        let mut data = Vec::new();
        ciborium::into_writer(snapshot, &mut data).map_err(|e| StoreError::codec(e.to_string()))?;

        let temp_path = self.path.join(SNAPSHOT_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        if sync {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&temp_path, self.path.join(SNAPSHOT_FILE))?;
        if sync {
            self.sync_directory()?;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StoreResult<()> {
        // NTFS journals metadata; directory handles cannot be fsynced.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn create_and_lock() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("db");

        let dir = DatabaseDir::open(&db_path, true).unwrap();
        assert!(dir.is_new_database());
        assert!(matches!(
            DatabaseDir::open(&db_path, true),
            Err(StoreError::DatabaseLocked)
        ));

        drop(dir);
        assert!(DatabaseDir::open(&db_path, true).is_ok());
    }

    #[test]
    fn missing_dir_without_create() {
        let temp = tempdir().unwrap();
        let result = DatabaseDir::open(&temp.path().join("absent"), false);
        assert!(matches!(result, Err(StoreError::InvalidFormat { .. })));
    }

    #[test]
    fn snapshot_persists() {
        let temp = tempdir().unwrap();
        let dir = DatabaseDir::open(temp.path(), true).unwrap();
        assert!(dir.load_snapshot::<BTreeMap<String, u64>>().unwrap().is_none());

        let mut snapshot = BTreeMap::new();
        snapshot.insert("a".to_string(), 1u64);
        dir.save_snapshot(&snapshot, true).unwrap();

        let loaded: BTreeMap<String, u64> = dir.load_snapshot().unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(!dir.is_new_database());
    }
}
