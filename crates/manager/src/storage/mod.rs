//! Persistent storage contract and key layout.
//!
//! # Key layout
//!
//! ```text
//! certificates/
//! └── <issuer>/
//!     └── <name>/
//!         ├── <name>.crt    # Certificate chain (PEM)
//!         ├── <name>.key    # Private key (PEM)
//!         └── <name>.json   # Certificate metadata
//! ocsp/
//! └── <name>-<hash prefix> # Latest good OCSP staple (JSON)
//! locks/
//! └── <lock>.lock          # Distributed lock files
//! ```
//!
//! Keys always use `/` as separator regardless of platform.

use async_trait::async_trait;
use certward_common::OperationContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::StorageError;

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Metadata about a stored key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub key: String,
    pub modified: DateTime<Utc>,
    pub size: u64,
    /// False for "directories" (prefixes of other keys)
    pub is_terminal: bool,
}

/// Key/value storage with distributed locks.
///
/// `lock` may block; it must return once the lock is held, or with an error
/// when `ctx` is cancelled or its deadline passes. Implementations should
/// expire locks whose holder has gone away.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    async fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Delete a key and, if it is a prefix, everything under it. Deleting a
    /// missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> bool;

    /// Keys directly under `prefix`, or every terminal key beneath it when
    /// `recursive` is set. Returned keys include the prefix.
    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>, StorageError>;

    async fn stat(&self, key: &str) -> Result<KeyInfo, StorageError>;

    async fn lock(&self, ctx: &OperationContext, name: &str) -> Result<(), StorageError>;

    async fn unlock(&self, name: &str) -> Result<(), StorageError>;
}

// ============================================================================
// Key layout
// ============================================================================

/// Builds storage keys for certificates, staples, and locks
pub struct StorageKeys;

impl StorageKeys {
    pub const CERTIFICATES: &'static str = "certificates";
    pub const OCSP: &'static str = "ocsp";
    pub const LOCKS: &'static str = "locks";

    /// Make `s` safe to use as a single path component
    pub fn safe(s: &str) -> String {
        s.trim()
            .to_lowercase()
            .replace(' ', "_")
            .replace('+', "_plus_")
            .replace('*', "wildcard_")
            .replace(':', "-")
            .replace("..", "")
            .replace(['/', '\\'], "_")
    }

    pub fn issuer_prefix(issuer_key: &str) -> String {
        format!("{}/{}", Self::CERTIFICATES, Self::safe(issuer_key))
    }

    pub fn site_prefix(issuer_key: &str, name: &str) -> String {
        format!("{}/{}", Self::issuer_prefix(issuer_key), Self::safe(name))
    }

    pub fn site_cert(issuer_key: &str, name: &str) -> String {
        let safe = Self::safe(name);
        format!("{}/{safe}.crt", Self::site_prefix(issuer_key, name))
    }

    pub fn site_private_key(issuer_key: &str, name: &str) -> String {
        let safe = Self::safe(name);
        format!("{}/{safe}.key", Self::site_prefix(issuer_key, name))
    }

    pub fn site_meta(issuer_key: &str, name: &str) -> String {
        let safe = Self::safe(name);
        format!("{}/{safe}.json", Self::site_prefix(issuer_key, name))
    }

    /// Key of the OCSP staple for a certificate
    pub fn ocsp_staple(names: &[String], hash: &str) -> String {
        let name = names.first().map(String::as_str).unwrap_or("unknown");
        let prefix = hash.get(..8).unwrap_or(hash);
        format!("{}/{}-{prefix}", Self::OCSP, Self::safe(name))
    }

    pub fn lock(name: &str) -> String {
        format!("{}/{}.lock", Self::LOCKS, Self::safe(name))
    }
}

// ============================================================================
// Stored certificate resources
// ============================================================================

/// Certificate metadata stored alongside the certificate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateMeta {
    /// Names the certificate was requested for
    pub names: Vec<String>,
    pub issued: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub issuer_key: String,
    /// Opaque issuer-specific data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_data: Option<serde_json::Value>,
}

/// A stored certificate with its key and metadata
#[derive(Debug, Clone)]
pub struct StoredCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub meta: CertificateMeta,
}

/// Persist the key, chain, and metadata for `name` under the issuer's prefix
pub async fn save_certificate(
    storage: &dyn Storage,
    name: &str,
    stored: &StoredCertificate,
) -> Result<(), StorageError> {
    let issuer = &stored.meta.issuer_key;
    storage
        .store(&StorageKeys::site_private_key(issuer, name), stored.key_pem.as_bytes())
        .await?;
    storage
        .store(&StorageKeys::site_cert(issuer, name), stored.cert_pem.as_bytes())
        .await?;
    let meta = serde_json::to_vec_pretty(&stored.meta)?;
    storage.store(&StorageKeys::site_meta(issuer, name), &meta).await?;

    debug!(name = %name, issuer = %issuer, expires = %stored.meta.expires, "Saved certificate");
    Ok(())
}

/// Load the certificate stored for `name` by one issuer
pub async fn load_certificate(
    storage: &dyn Storage,
    issuer_key: &str,
    name: &str,
) -> Result<StoredCertificate, StorageError> {
    let cert_pem = load_string(storage, &StorageKeys::site_cert(issuer_key, name)).await?;
    let key_pem = load_string(storage, &StorageKeys::site_private_key(issuer_key, name)).await?;
    let meta_raw = storage.load(&StorageKeys::site_meta(issuer_key, name)).await?;
    let meta: CertificateMeta = serde_json::from_slice(&meta_raw)?;

    trace!(name = %name, issuer = %issuer_key, "Loaded certificate from storage");
    Ok(StoredCertificate {
        cert_pem,
        key_pem,
        meta,
    })
}

/// Load only the private key stored for `name` by one issuer
pub async fn load_private_key(
    storage: &dyn Storage,
    issuer_key: &str,
    name: &str,
) -> Result<String, StorageError> {
    load_string(storage, &StorageKeys::site_private_key(issuer_key, name)).await
}

/// True if the chain, key, and metadata are all present
pub async fn has_certificate(storage: &dyn Storage, issuer_key: &str, name: &str) -> bool {
    storage.exists(&StorageKeys::site_cert(issuer_key, name)).await
        && storage
            .exists(&StorageKeys::site_private_key(issuer_key, name))
            .await
        && storage.exists(&StorageKeys::site_meta(issuer_key, name)).await
}

/// Remove everything stored for `name` by one issuer
pub async fn delete_certificate(
    storage: &dyn Storage,
    issuer_key: &str,
    name: &str,
) -> Result<(), StorageError> {
    storage.delete(&StorageKeys::site_cert(issuer_key, name)).await?;
    storage
        .delete(&StorageKeys::site_private_key(issuer_key, name))
        .await?;
    storage.delete(&StorageKeys::site_meta(issuer_key, name)).await?;
    Ok(())
}

async fn load_string(storage: &dyn Storage, key: &str) -> Result<String, StorageError> {
    let bytes = storage.load(key).await?;
    String::from_utf8(bytes).map_err(|_| StorageError::Backend(format!("'{key}' is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_safe_names() {
        assert_eq!(StorageKeys::safe("*.Example.com"), "wildcard_.example.com");
        assert_eq!(StorageKeys::safe("[::1]:443"), "[--1]-443");
        assert_eq!(StorageKeys::safe("../../etc/passwd"), "__etc_passwd");
        assert_eq!(StorageKeys::safe("a b+c"), "a_b_plus_c");
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(
            StorageKeys::site_cert("acme.example.net-directory", "*.example.com"),
            "certificates/acme.example.net-directory/wildcard_.example.com/wildcard_.example.com.crt"
        );
        assert_eq!(
            StorageKeys::ocsp_staple(&["a.example.com".to_string()], "0123456789abcdef"),
            "ocsp/a.example.com-01234567"
        );
        assert_eq!(StorageKeys::lock("issue_cert_a.example.com"), "locks/issue_cert_a.example.com.lock");
    }

    #[tokio::test]
    async fn test_save_and_load_certificate() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let now = Utc::now();
        let stored = StoredCertificate {
            cert_pem: "CERT".to_string(),
            key_pem: "KEY".to_string(),
            meta: CertificateMeta {
                names: vec!["a.example.com".to_string()],
                issued: now,
                expires: now + chrono::Duration::days(90),
                issuer_key: "test-ca".to_string(),
                issuer_data: None,
            },
        };

        assert!(!has_certificate(storage.as_ref(), "test-ca", "a.example.com").await);
        save_certificate(storage.as_ref(), "a.example.com", &stored).await.unwrap();
        assert!(has_certificate(storage.as_ref(), "test-ca", "a.example.com").await);

        let loaded = load_certificate(storage.as_ref(), "test-ca", "a.example.com").await.unwrap();
        assert_eq!(loaded.cert_pem, "CERT");
        assert_eq!(loaded.key_pem, "KEY");
        assert_eq!(loaded.meta, stored.meta);

        delete_certificate(storage.as_ref(), "test-ca", "a.example.com").await.unwrap();
        let err = load_certificate(storage.as_ref(), "test-ca", "a.example.com").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
