//! Certward certificate manager
//!
//! Keeps TLS certificates in memory, serves the right one for each
//! handshake, and obtains or renews them through a pluggable [`Issuer`].
//!
//! - **Cache**: hash- and name-indexed certificate set with random eviction
//! - **Handshake resolution**: exact, wildcard, and default lookups with
//!   on-demand issuance behind a per-name single-flight table
//! - **Maintenance**: background renewal and OCSP refresh, supervised
//! - **Storage**: file and in-memory backends with distributed locks
//! - **rustls**: [`CertResolver`] plugs the manager into a `ServerConfig`
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use certward::{CacheOptions, CertCache, CertManager, ManagerConfig, MemoryStorage};
//!
//! let cache = Arc::new(CertCache::new(CacheOptions::default()));
//! let config = ManagerConfig::new(Arc::new(MemoryStorage::new())).with_issuer(my_issuer);
//! let manager = CertManager::new(Arc::clone(&cache), config);
//! manager.start_maintenance();
//! manager.manage_sync(&ctx, &["example.com"]).await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod cache;
pub mod certificate;
pub mod error;
pub mod handshake;
pub mod issuer;
pub mod maintenance;
pub mod manager;
pub mod ocsp;
pub mod selection;
pub mod singleflight;
pub mod storage;
pub mod tls;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Cache and certificates
pub use cache::{CacheOptions, CertCache};
pub use certificate::{
    in_renewal_window, normalize_name, normalize_names, Certificate, ChainInfo, KeyAlgorithm,
};

// Errors
pub use error::{CertError, IssueError, OcspError, StorageError};

// Manager, policy and handshakes
pub use handshake::CacheHit;
pub use manager::{
    subject_qualifies_for_cert, CertEvent, CertManager, DecisionFn, ManagerConfig, OnDemandPolicy,
};

// Maintenance
pub use maintenance::{
    clean_storage, CleanOptions, CleanReport, ConfigSource, MaintenanceReport, MaintenanceScheduler,
    OcspReport, DEFAULT_EXPIRED_CERT_GRACE_PERIOD,
};

// Collaborator contracts
pub use issuer::{CertificateRequest, EcdsaKeyGenerator, IssuedCertificate, Issuer, KeyGenerator};
pub use ocsp::{OcspResponse, OcspStapler, OcspStatus};
pub use selection::{CertificateSelector, ClientHelloInfo, DefaultSelector};
pub use storage::{FileStorage, KeyInfo, MemoryStorage, Storage, StorageKeys};

// rustls
pub use tls::CertResolver;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use certward_common::OperationContext;
    use chrono::{DateTime, Duration, Utc};
    use parking_lot::Mutex;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    use crate::error::IssueError;
    use crate::issuer::{CertificateRequest, IssuedCertificate, Issuer};

    /// Issuer that self-signs the requested names with the requested key
    pub(crate) struct TestIssuer {
        key: String,
        calls: AtomicU32,
        reject: AtomicBool,
        /// (age, remaining) of issued certificates
        validity: Mutex<(Duration, Duration)>,
        delay: Mutex<std::time::Duration>,
    }

    impl TestIssuer {
        pub(crate) fn new(key: &str) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_string(),
                calls: AtomicU32::new(0),
                reject: AtomicBool::new(false),
                validity: Mutex::new((Duration::hours(1), Duration::days(90))),
                delay: Mutex::new(std::time::Duration::ZERO),
            })
        }

        pub(crate) fn rejecting(key: &str) -> Arc<Self> {
            let issuer = Self::new(key);
            issuer.reject.store(true, Ordering::SeqCst);
            issuer
        }

        pub(crate) fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn set_reject(&self, reject: bool) {
            self.reject.store(reject, Ordering::SeqCst);
        }

        /// Sleep this long inside every issue call
        pub(crate) fn set_delay(&self, delay: std::time::Duration) {
            *self.delay.lock() = delay;
        }

        /// Issue certificates valid from `age` ago until `remaining` from now
        pub(crate) fn set_validity(&self, age: Duration, remaining: Duration) {
            *self.validity.lock() = (age, remaining);
        }
    }

    #[async_trait]
    impl Issuer for TestIssuer {
        async fn issue(
            &self,
            _ctx: &OperationContext,
            request: &CertificateRequest,
        ) -> Result<IssuedCertificate, IssueError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.reject.load(Ordering::SeqCst) {
                return Err(IssueError::Rejected("unauthorized".to_string()));
            }
            let (age, remaining) = *self.validity.lock();
            let now = Utc::now();
            let names: Vec<&str> = request.names.iter().map(String::as_str).collect();
            Ok(IssuedCertificate {
                certificate_pem: certify(&names, now - age, now + remaining, &request.private_key_pem),
                metadata: None,
            })
        }

        fn issuer_key(&self) -> String {
            self.key.clone()
        }
    }

    /// Mint a self-signed chain and its key, both PEM
    pub(crate) fn self_signed(
        names: &[&str],
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let chain = certify(names, not_before, not_after, &key.serialize_pem());
        (chain, key.serialize_pem())
    }

    /// Mint a self-signed chain for an existing PEM private key
    pub(crate) fn certify(
        names: &[&str],
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        key_pem: &str,
    ) -> String {
        let key = KeyPair::from_pem(key_pem).unwrap();
        let mut params =
            CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, names[0]);
        params.distinguished_name = dn;
        params.not_before = time::OffsetDateTime::from_unix_timestamp(not_before.timestamp()).unwrap();
        params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.timestamp()).unwrap();
        params.self_signed(&key).unwrap().pem()
    }
}
