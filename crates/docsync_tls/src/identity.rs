//! TLS identities: a private key plus its certificate chain.

use crate::error::{TlsError, TlsResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Duration, OffsetDateTime};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use zeroize::Zeroizing;

/// Default lifetime of generated certificates.
pub const DEFAULT_VALIDITY: Duration = Duration::days(365);

/// What a generated certificate is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyUsage {
    /// Listener (server) certificate.
    Server,
    /// Replicator (client) certificate.
    Client,
}

/// Subject attributes of a generated certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateAttributes {
    /// Common name. Required.
    pub common_name: String,
    /// Organization.
    pub organization: Option<String>,
    /// Organizational unit.
    pub organizational_unit: Option<String>,
    /// Two-letter country code.
    pub country: Option<String>,
    /// Locality (city).
    pub locality: Option<String>,
}

impl CertificateAttributes {
    /// Creates attributes with the given common name.
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Self::default()
        }
    }

    /// Sets the organization.
    #[must_use]
    pub fn with_organization(mut self, value: impl Into<String>) -> Self {
        self.organization = Some(value.into());
        self
    }

    /// Sets the organizational unit.
    #[must_use]
    pub fn with_organizational_unit(mut self, value: impl Into<String>) -> Self {
        self.organizational_unit = Some(value.into());
        self
    }

    /// Sets the country.
    #[must_use]
    pub fn with_country(mut self, value: impl Into<String>) -> Self {
        self.country = Some(value.into());
        self
    }

    /// Sets the locality.
    #[must_use]
    pub fn with_locality(mut self, value: impl Into<String>) -> Self {
        self.locality = Some(value.into());
        self
    }

    fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.as_str());
        if let Some(o) = &self.organization {
            dn.push(DnType::OrganizationName, o.as_str());
        }
        if let Some(ou) = &self.organizational_unit {
            dn.push(DnType::OrganizationalUnitName, ou.as_str());
        }
        if let Some(c) = &self.country {
            dn.push(DnType::CountryName, c.as_str());
        }
        if let Some(l) = &self.locality {
            dn.push(DnType::LocalityName, l.as_str());
        }
        dn
    }
}

/// A key pair and certificate chain (leaf first), optionally labelled.
///
/// Labelled identities live in an [`IdentityStore`](crate::IdentityStore)
/// until deleted. Unlabelled identities exist only as long as a handle does.
#[derive(Clone)]
pub struct TlsIdentity {
    label: Option<String>,
    certs: Vec<CertificateDer<'static>>,
    key: Zeroizing<Vec<u8>>,
    expiration: OffsetDateTime,
}

impl TlsIdentity {
    /// Generates a key pair and a self-signed certificate.
    ///
    /// The identity is not stored; see
    /// [`IdentityStore::create_identity`](crate::IdentityStore::create_identity).
    pub fn generate(
        usage: KeyUsage,
        attributes: &CertificateAttributes,
        expiration: Option<OffsetDateTime>,
    ) -> TlsResult<Self> {
        if attributes.common_name.is_empty() {
            return Err(TlsError::CertificateGeneration(
                "common name is required".into(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let not_after = expiration.unwrap_or(now + DEFAULT_VALIDITY);
        if not_after <= now {
            return Err(TlsError::CertificateGeneration(
                "expiration must be in the future".into(),
            ));
        }

        let mut params = CertificateParams::new(vec!["localhost".to_string()])?;
        params.distinguished_name = attributes.distinguished_name();
        // Tolerate small clock skew between peers.
        params.not_before = now - Duration::hours(1);
        params.not_after = not_after;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = match usage {
            KeyUsage::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
            KeyUsage::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
        };

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        tracing::debug!(
            common_name = %attributes.common_name,
            usage = ?usage,
            "generated self-signed certificate"
        );

        Ok(Self {
            label: None,
            certs: vec![CertificateDer::from(cert.der().to_vec())],
            key: Zeroizing::new(key_pair.serialize_der()),
            expiration: not_after,
        })
    }

    /// Builds an identity from a DER chain and private key.
    ///
    /// The expiration is read from the leaf certificate.
    pub fn from_parts(certs: Vec<CertificateDer<'static>>, key_der: Vec<u8>) -> TlsResult<Self> {
        let leaf = certs
            .first()
            .ok_or_else(|| TlsError::InvalidCertificate("empty certificate chain".into()))?;
        let expiration = leaf_expiration(leaf)?;
        let key = Zeroizing::new(key_der);
        PrivateKeyDer::try_from(key.to_vec())
            .map_err(|e| TlsError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self {
            label: None,
            certs,
            key,
            expiration,
        })
    }

    /// Parses an identity from PEM text containing certificates and a key.
    pub fn from_pem(data: &[u8]) -> TlsResult<Self> {
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &data[..])
            .collect::<Result<_, _>>()
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
        let key = rustls_pemfile::private_key(&mut &data[..])
            .map_err(|e| TlsError::InvalidPrivateKey(e.to_string()))?
            .ok_or_else(|| TlsError::InvalidPrivateKey("no private key in PEM data".into()))?;
        Self::from_parts(certs, key.secret_der().to_vec())
    }

    pub(crate) fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }

    /// Returns the label, or None for anonymous identities.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Returns the certificate chain, leaf first.
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }

    /// Returns the leaf certificate.
    pub fn leaf(&self) -> &CertificateDer<'static> {
        // Constructors reject empty chains.
        &self.certs[0]
    }

    /// Returns a copy of the private key for building TLS configs.
    pub fn private_key(&self) -> TlsResult<PrivateKeyDer<'static>> {
        PrivateKeyDer::try_from(self.key.to_vec())
            .map_err(|e| TlsError::InvalidPrivateKey(e.to_string()))
    }

    pub(crate) fn key_der(&self) -> &[u8] {
        &self.key
    }

    /// Returns when the leaf certificate expires.
    pub fn expiration(&self) -> OffsetDateTime {
        self.expiration
    }

    /// Returns true if the leaf certificate has expired.
    pub fn is_expired(&self) -> bool {
        self.expiration <= OffsetDateTime::now_utc()
    }

    /// Returns the leaf certificate's common name.
    pub fn common_name(&self) -> Option<String> {
        let (_, cert) = X509Certificate::from_der(self.leaf()).ok()?;
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        cn
    }

    /// Encodes the chain and key as PEM.
    pub fn to_pem(&self) -> Zeroizing<String> {
        let mut out = String::new();
        for cert in &self.certs {
            out.push_str(&pem_block("CERTIFICATE", cert));
        }
        out.push_str(&pem_block("PRIVATE KEY", &self.key));
        Zeroizing::new(out)
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("label", &self.label)
            .field("chain_len", &self.certs.len())
            .field("expiration", &self.expiration)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for TlsIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label && self.certs == other.certs
    }
}

fn leaf_expiration(leaf: &CertificateDer<'_>) -> TlsResult<OffsetDateTime> {
    let (_, cert) = X509Certificate::from_der(leaf)
        .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
    Ok(cert.validity().not_after.to_datetime())
}

fn pem_block(tag: &str, der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {tag}-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {tag}-----\n"));
    out
}

/// Returns true if a DER certificate is self-signed (issuer equals subject
/// and the signature verifies with its own key).
pub fn is_self_signed(der: &[u8]) -> bool {
    match X509Certificate::from_der(der) {
        Ok((_, cert)) => cert.issuer() == cert.subject() && cert.verify_signature(None).is_ok(),
        Err(_) => false,
    }
}
