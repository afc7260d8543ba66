//! Labelled identity storage.
//!
//! Identities are kept in memory or as one CBOR file per label in a
//! directory. Create, import and delete are serialized by an in-process
//! mutex and, for directory stores, an advisory lock file, so concurrent
//! "create anonymous identity" and "delete anonymous identities" calls
//! cannot interleave.
//!
//! Anonymous identities generated for listeners are stored under an internal
//! label namespace. They are returned without a label and are not listed by
//! [`IdentityStore::labels`].

use crate::bundle;
use crate::error::{TlsError, TlsResult};
use crate::identity::{CertificateAttributes, KeyUsage, TlsIdentity};
use fs2::FileExt;
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Internal label prefix of auto-generated listener identities.
const ANONYMOUS_PREFIX: &str = "docsync-anon-";
const FILE_EXTENSION: &str = "identity";
const LOCK_FILE: &str = "LOCK";

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    label: String,
    certs: Vec<Vec<u8>>,
    key: Vec<u8>,
}

impl StoredIdentity {
    fn from_identity(label: &str, identity: &TlsIdentity) -> Self {
        Self {
            label: label.to_string(),
            certs: identity
                .certificates()
                .iter()
                .map(|c| c.as_ref().to_vec())
                .collect(),
            key: identity.key_der().to_vec(),
        }
    }

    fn into_identity(self) -> TlsResult<TlsIdentity> {
        let certs = self.certs.into_iter().map(CertificateDer::from).collect();
        TlsIdentity::from_parts(certs, self.key)
    }
}

enum Backend {
    Memory(BTreeMap<String, StoredIdentity>),
    Directory(PathBuf),
}

/// A keyed store of TLS identities.
pub struct IdentityStore {
    backend: Mutex<Backend>,
}

impl IdentityStore {
    /// Opens (creating if needed) a directory-backed store.
    pub fn open(path: &Path) -> TlsResult<Self> {
        fs::create_dir_all(path)?;
        Ok(Self {
            backend: Mutex::new(Backend::Directory(path.to_path_buf())),
        })
    }

    /// Creates an empty in-memory store.
    pub fn in_memory() -> Self {
        Self {
            backend: Mutex::new(Backend::Memory(BTreeMap::new())),
        }
    }

    /// Generates a self-signed identity and stores it under `label`.
    ///
    /// With no label the identity is returned without being stored.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::LabelExists`] if the label is taken; delete it first.
    pub fn create_identity(
        &self,
        usage: KeyUsage,
        attributes: &CertificateAttributes,
        expiration: Option<OffsetDateTime>,
        label: Option<&str>,
    ) -> TlsResult<TlsIdentity> {
        let identity = TlsIdentity::generate(usage, attributes, expiration)?;
        match label {
            Some(label) => self.insert_new(label, identity),
            None => Ok(identity),
        }
    }

    /// Imports an identity from PEM text or a password-protected bundle and
    /// stores it under `label`.
    pub fn import_identity(
        &self,
        data: &[u8],
        password: Option<&str>,
        label: &str,
    ) -> TlsResult<TlsIdentity> {
        let identity = if bundle::is_bundle(data) {
            let password = password.ok_or_else(|| {
                TlsError::Decryption("a password is required for identity bundles".into())
            })?;
            bundle::open(data, password)?
        } else {
            TlsIdentity::from_pem(data)?
        };
        self.insert_new(label, identity)
    }

    /// Exports a stored identity as a password-protected bundle.
    pub fn export_identity(&self, label: &str, password: &str) -> TlsResult<Vec<u8>> {
        let identity = self
            .identity(label)?
            .ok_or_else(|| TlsError::IdentityNotFound(label.to_string()))?;
        bundle::seal(&identity, password)
    }

    /// Loads the identity stored under `label`.
    pub fn identity(&self, label: &str) -> TlsResult<Option<TlsIdentity>> {
        let mut backend = self.backend.lock();
        let _lock = DirLock::acquire(&backend)?;
        Ok(load(&mut backend, label)?.map(|identity| identity.with_label(Some(label.to_string()))))
    }

    /// Deletes the identity stored under `label`. Missing labels are ignored.
    pub fn delete_identity(&self, label: &str) -> TlsResult<()> {
        let mut backend = self.backend.lock();
        let _lock = DirLock::acquire(&backend)?;
        if remove(&mut backend, label)? {
            tracing::debug!(label, "deleted identity");
        }
        Ok(())
    }

    /// Returns the labels of all user-created identities.
    pub fn labels(&self) -> TlsResult<Vec<String>> {
        let backend = self.backend.lock();
        let _lock = DirLock::acquire(&backend)?;
        Ok(all_labels(&backend)?
            .into_iter()
            .filter(|l| !l.starts_with(ANONYMOUS_PREFIX))
            .collect())
    }

    /// Returns the anonymous server identity for `key`, generating and
    /// storing a new one if none exists or the stored one has expired.
    pub fn anonymous_identity(&self, key: &str) -> TlsResult<TlsIdentity> {
        let label = format!("{ANONYMOUS_PREFIX}{key}");
        let mut backend = self.backend.lock();
        let _lock = DirLock::acquire(&backend)?;

        if let Some(existing) = load(&mut backend, &label)? {
            if !existing.is_expired() {
                return Ok(existing);
            }
            tracing::info!(key, "anonymous identity expired, regenerating");
            remove(&mut backend, &label)?;
        }

        let identity = TlsIdentity::generate(
            KeyUsage::Server,
            &CertificateAttributes::new(format!("docsync-{key}")),
            None,
        )?;
        save(&mut backend, &label, &identity)?;
        tracing::debug!(key, "generated anonymous identity");
        Ok(identity)
    }

    /// Deletes every anonymous identity. Returns how many were removed.
    pub fn delete_anonymous_identities(&self) -> TlsResult<usize> {
        let mut backend = self.backend.lock();
        let _lock = DirLock::acquire(&backend)?;
        let mut removed = 0;
        for label in all_labels(&backend)? {
            if label.starts_with(ANONYMOUS_PREFIX) && remove(&mut backend, &label)? {
                removed += 1;
            }
        }
        tracing::debug!(removed, "deleted anonymous identities");
        Ok(removed)
    }

    fn insert_new(&self, label: &str, identity: TlsIdentity) -> TlsResult<TlsIdentity> {
        if label.is_empty() || label.starts_with(ANONYMOUS_PREFIX) {
            return Err(TlsError::InvalidCertificate(format!(
                "invalid identity label: {label:?}"
            )));
        }
        let mut backend = self.backend.lock();
        let _lock = DirLock::acquire(&backend)?;
        if load(&mut backend, label)?.is_some() {
            return Err(TlsError::LabelExists(label.to_string()));
        }
        save(&mut backend, label, &identity)?;
        tracing::debug!(label, "stored identity");
        Ok(identity.with_label(Some(label.to_string())))
    }
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &*self.backend.lock() {
            Backend::Memory(map) => format!("memory ({} identities)", map.len()),
            Backend::Directory(path) => path.display().to_string(),
        };
        f.debug_struct("IdentityStore").field("backend", &kind).finish()
    }
}

/// Cross-process advisory lock held for the duration of one store operation.
struct DirLock(Option<File>);

impl DirLock {
    fn acquire(backend: &Backend) -> TlsResult<Self> {
        match backend {
            Backend::Memory(_) => Ok(Self(None)),
            Backend::Directory(dir) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(dir.join(LOCK_FILE))?;
                file.lock_exclusive()?;
                Ok(Self(Some(file)))
            }
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Some(file) = &self.0 {
            let _ = FileExt::unlock(file);
        }
    }
}

fn file_path(dir: &Path, label: &str) -> PathBuf {
    dir.join(format!("{}.{FILE_EXTENSION}", hex::encode(label.as_bytes())))
}

fn load(backend: &mut Backend, label: &str) -> TlsResult<Option<TlsIdentity>> {
    let stored = match backend {
        Backend::Memory(map) => match map.get(label) {
            Some(s) => StoredIdentity {
                label: s.label.clone(),
                certs: s.certs.clone(),
                key: s.key.clone(),
            },
            None => return Ok(None),
        },
        Backend::Directory(dir) => {
            let path = file_path(dir, label);
            if !path.exists() {
                return Ok(None);
            }
            let data = fs::read(&path)?;
            ciborium::from_reader(data.as_slice()).map_err(|e| TlsError::Codec(e.to_string()))?
        }
    };
    stored.into_identity().map(Some)
}

fn save(backend: &mut Backend, label: &str, identity: &TlsIdentity) -> TlsResult<()> {
    let stored = StoredIdentity::from_identity(label, identity);
    match backend {
        Backend::Memory(map) => {
            map.insert(label.to_string(), stored);
        }
        Backend::Directory(dir) => {
            let mut data = Vec::new();
            ciborium::into_writer(&stored, &mut data).map_err(|e| TlsError::Codec(e.to_string()))?;
            let path = file_path(dir, label);
            let temp = path.with_extension("tmp");
            let mut file = File::create(&temp)?;
            file.write_all(&data)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&temp, &path)?;
        }
    }
    Ok(())
}

fn remove(backend: &mut Backend, label: &str) -> TlsResult<bool> {
    match backend {
        Backend::Memory(map) => Ok(map.remove(label).is_some()),
        Backend::Directory(dir) => {
            let path = file_path(dir, label);
            match fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
    }
}

fn all_labels(backend: &Backend) -> TlsResult<Vec<String>> {
    match backend {
        Backend::Memory(map) => Ok(map.keys().cloned().collect()),
        Backend::Directory(dir) => {
            let mut labels = Vec::new();
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                    continue;
                }
                let decoded = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| hex::decode(s).ok())
                    .and_then(|b| String::from_utf8(b).ok());
                if let Some(label) = decoded {
                    labels.push(label);
                }
            }
            labels.sort();
            Ok(labels)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> CertificateAttributes {
        CertificateAttributes::new("store-test")
    }

    #[test]
    fn create_get_delete() {
        let store = IdentityStore::in_memory();
        let created = store
            .create_identity(KeyUsage::Server, &attrs(), None, Some("server"))
            .unwrap();
        assert_eq!(created.label(), Some("server"));

        let loaded = store.identity("server").unwrap().unwrap();
        assert_eq!(loaded, created);

        store.delete_identity("server").unwrap();
        assert!(store.identity("server").unwrap().is_none());
        // Deleting again is a no-op.
        store.delete_identity("server").unwrap();
    }

    #[test]
    fn duplicate_label_rejected() {
        let store = IdentityStore::in_memory();
        store
            .create_identity(KeyUsage::Client, &attrs(), None, Some("dup"))
            .unwrap();
        let err = store
            .create_identity(KeyUsage::Client, &attrs(), None, Some("dup"))
            .unwrap_err();
        assert!(matches!(err, TlsError::LabelExists(label) if label == "dup"));
    }

    #[test]
    fn unlabelled_identity_not_stored() {
        let store = IdentityStore::in_memory();
        let identity = store
            .create_identity(KeyUsage::Client, &attrs(), None, None)
            .unwrap();
        assert!(identity.label().is_none());
        assert!(store.labels().unwrap().is_empty());
    }

    #[test]
    fn anonymous_identities_are_reused_and_hidden() {
        let store = IdentityStore::in_memory();
        let first = store.anonymous_identity("db-uuid").unwrap();
        let second = store.anonymous_identity("db-uuid").unwrap();
        assert_eq!(first.leaf(), second.leaf());
        assert!(first.label().is_none());
        assert!(store.labels().unwrap().is_empty());

        let other = store.anonymous_identity("other-db").unwrap();
        assert_ne!(other.leaf(), first.leaf());

        assert_eq!(store.delete_anonymous_identities().unwrap(), 2);
        let regenerated = store.anonymous_identity("db-uuid").unwrap();
        assert_ne!(regenerated.leaf(), first.leaf());
    }

    #[test]
    fn reserved_labels_rejected() {
        let store = IdentityStore::in_memory();
        assert!(store
            .create_identity(KeyUsage::Client, &attrs(), None, Some("docsync-anon-x"))
            .is_err());
        assert!(store
            .create_identity(KeyUsage::Client, &attrs(), None, Some(""))
            .is_err());
    }

    #[test]
    fn import_pem_and_bundle() {
        let store = IdentityStore::in_memory();
        let source = TlsIdentity::generate(KeyUsage::Client, &attrs(), None).unwrap();

        let pem = source.to_pem();
        let imported = store.import_identity(pem.as_bytes(), None, "pem").unwrap();
        assert_eq!(imported.certificates(), source.certificates());

        let exported = store.export_identity("pem", "secret").unwrap();
        let reimported = store
            .import_identity(&exported, Some("secret"), "bundle")
            .unwrap();
        assert_eq!(reimported.certificates(), source.certificates());

        assert!(store.import_identity(&exported, None, "nopass").is_err());
        assert_eq!(store.labels().unwrap(), vec!["bundle", "pem"]);
    }
}
