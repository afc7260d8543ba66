//! Password-protected identity bundles.
//!
//! Layout: `MAGIC || CBOR(Bundle)`, where the bundle carries a random salt
//! and `nonce || AES-256-GCM(CBOR(Payload))`. The key is derived from the
//! password with HKDF-SHA256.

use crate::error::{TlsError, TlsResult};
use crate::identity::TlsIdentity;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Prefix identifying an encrypted bundle.
pub const BUNDLE_MAGIC: &[u8; 4] = b"DSID";

const BUNDLE_VERSION: u8 = 1;
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

#[derive(Serialize, Deserialize)]
struct Bundle {
    version: u8,
    salt: Vec<u8>,
    sealed: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct Payload {
    certs: Vec<Vec<u8>>,
    key: Vec<u8>,
}

fn derive_key(password: &str, salt: &[u8]) -> TlsResult<Zeroizing<[u8; KEY_SIZE]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), password.as_bytes());
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(b"docsync-identity-bundle-v1", &mut key[..])
        .map_err(|_| TlsError::Decryption("key derivation failed".into()))?;
    Ok(key)
}

/// Returns true if `data` looks like an encrypted bundle.
pub fn is_bundle(data: &[u8]) -> bool {
    data.starts_with(BUNDLE_MAGIC)
}

/// Encrypts an identity into a bundle.
pub fn seal(identity: &TlsIdentity, password: &str) -> TlsResult<Vec<u8>> {
    let payload = Payload {
        certs: identity
            .certificates()
            .iter()
            .map(|c| c.as_ref().to_vec())
            .collect(),
        key: identity.key_der().to_vec(),
    };
    let mut plaintext = Zeroizing::new(Vec::new());
    ciborium::into_writer(&payload, &mut *plaintext).map_err(|e| TlsError::Codec(e.to_string()))?;

    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let key = derive_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|_| TlsError::Decryption("invalid key length".into()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
        .map_err(|_| TlsError::Decryption("encryption failed".into()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend(ciphertext);

    let bundle = Bundle {
        version: BUNDLE_VERSION,
        salt: salt.to_vec(),
        sealed,
    };
    let mut out = BUNDLE_MAGIC.to_vec();
    ciborium::into_writer(&bundle, &mut out).map_err(|e| TlsError::Codec(e.to_string()))?;
    Ok(out)
}

/// Decrypts a bundle produced by [`seal`].
pub fn open(data: &[u8], password: &str) -> TlsResult<TlsIdentity> {
    let body = data
        .strip_prefix(BUNDLE_MAGIC.as_slice())
        .ok_or_else(|| TlsError::Codec("not an identity bundle".into()))?;
    let bundle: Bundle =
        ciborium::from_reader(body).map_err(|e| TlsError::Codec(e.to_string()))?;
    if bundle.version != BUNDLE_VERSION {
        return Err(TlsError::Codec(format!(
            "unsupported bundle version {}",
            bundle.version
        )));
    }
    if bundle.sealed.len() < NONCE_SIZE {
        return Err(TlsError::Decryption("bundle too short".into()));
    }

    let key = derive_key(password, &bundle.salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|_| TlsError::Decryption("invalid key length".into()))?;
    let (nonce, ciphertext) = bundle.sealed.split_at(NONCE_SIZE);
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TlsError::Decryption("wrong password or corrupt bundle".into()))?,
    );

    let payload: Payload =
        ciborium::from_reader(plaintext.as_slice()).map_err(|e| TlsError::Codec(e.to_string()))?;
    let certs = payload
        .certs
        .into_iter()
        .map(CertificateDer::from)
        .collect();
    TlsIdentity::from_parts(certs, payload.key)
}
