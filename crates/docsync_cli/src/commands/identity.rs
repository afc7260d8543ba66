//! Identity command implementations.

use docsync_tls::{CertificateAttributes, IdentityStore, KeyUsage};
use serde::Serialize;
use std::path::Path;

/// One row of `identity list`.
#[derive(Debug, Serialize)]
pub struct IdentitySummary {
    /// Label in the store.
    pub label: String,
    /// Leaf certificate common name.
    pub common_name: Option<String>,
    /// Expiration as RFC 3339 text.
    pub expires: String,
    /// Whether the leaf certificate has expired.
    pub expired: bool,
    /// Number of certificates in the chain.
    pub chain_length: usize,
}

/// Generates and stores a self-signed identity.
pub fn create(
    store: &Path,
    label: &str,
    common_name: &str,
    client: bool,
    organization: Option<String>,
    days: Option<i64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = IdentityStore::open(store)?;
    let mut attributes = CertificateAttributes::new(common_name);
    if let Some(organization) = organization {
        attributes = attributes.with_organization(organization);
    }
    let usage = if client {
        KeyUsage::Client
    } else {
        KeyUsage::Server
    };
    let expiration = days.map(|d| time::OffsetDateTime::now_utc() + time::Duration::days(d));

    let identity = store.create_identity(usage, &attributes, expiration, Some(label))?;
    println!("Created {label} (expires {})", identity.expiration());
    Ok(())
}

/// Imports a PEM file or encrypted bundle.
pub fn import(
    store: &Path,
    file: &Path,
    label: &str,
    password: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = IdentityStore::open(store)?;
    let data = std::fs::read(file)?;
    let identity = store.import_identity(&data, password, label)?;
    println!(
        "Imported {label}: {} certificate(s), common name {:?}",
        identity.certificates().len(),
        identity.common_name()
    );
    Ok(())
}

/// Writes an encrypted bundle of a stored identity.
pub fn export(
    store: &Path,
    label: &str,
    output: &Path,
    password: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = IdentityStore::open(store)?;
    let bundle = store.export_identity(label, password)?;
    std::fs::write(output, bundle)?;
    println!("Exported {label} to {}", output.display());
    Ok(())
}

/// Deletes a stored identity.
pub fn delete(store: &Path, label: &str) -> Result<(), Box<dyn std::error::Error>> {
    IdentityStore::open(store)?.delete_identity(label)?;
    println!("Deleted {label}");
    Ok(())
}

/// Lists stored identities.
pub fn list(store: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = IdentityStore::open(store)?;
    let mut rows = Vec::new();
    for label in store.labels()? {
        let Some(identity) = store.identity(&label)? else {
            continue;
        };
        rows.push(IdentitySummary {
            common_name: identity.common_name(),
            expires: identity
                .expiration()
                .format(&time::format_description::well_known::Rfc3339)?,
            expired: identity.is_expired(),
            chain_length: identity.certificates().len(),
            label,
        });
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        _ => {
            if rows.is_empty() {
                println!("No identities");
            }
            for row in &rows {
                println!(
                    "{:<24} {:<32} {}{}",
                    row.label,
                    row.common_name.as_deref().unwrap_or("-"),
                    row.expires,
                    if row.expired { " (expired)" } else { "" }
                );
            }
        }
    }
    Ok(())
}

/// Deletes auto-generated listener identities.
pub fn purge_anonymous(store: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let removed = IdentityStore::open(store)?.delete_anonymous_identities()?;
    println!("Removed {removed} anonymous identities");
    Ok(())
}
