//! In-memory certificate cache.
//!
//! Certificates are indexed by content hash and by subject name. A name may
//! map to several certificates (for example an RSA and an ECDSA chain for
//! the same site). Both maps live in one [`CacheIndex`] behind a single
//! reader/writer lock, and every mutation goes through the methods here so
//! the two maps never disagree.
//!
//! The cache also owns the process-wide pieces the manager and scheduler
//! share: the job pool, the single-flight table, the set of storage locks
//! currently held, and the maintenance task handle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use certward_common::{supervise, JobPool, SupervisorHandle, DEFAULT_MAX_RESTARTS};
use certward_config::CacheConfig;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, error, info, trace, warn};

use crate::certificate::Certificate;
use crate::maintenance::{ConfigSource, MaintenanceScheduler};
use crate::ocsp::OcspResponse;
use crate::singleflight::SingleFlight;
use crate::storage::Storage;

/// Cache sizing and maintenance timing
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Maximum number of certificates (0 = unlimited)
    pub capacity: usize,
    pub renew_check_interval: Duration,
    pub ocsp_check_interval: Duration,
    /// Ceiling on concurrent background jobs
    pub max_workers: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl CacheOptions {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            capacity: config.capacity,
            renew_check_interval: Duration::from_secs(config.renew_check_interval_secs),
            ocsp_check_interval: Duration::from_secs(config.ocsp_check_interval_secs),
            max_workers: config.max_workers,
        }
    }
}

#[derive(Default)]
struct CacheIndex {
    certs: HashMap<String, Certificate>,
    /// name -> hashes of the certificates covering it
    names: HashMap<String, Vec<String>>,
}

impl CacheIndex {
    fn insert(&mut self, cert: Certificate, capacity: usize) -> bool {
        if self.certs.contains_key(cert.hash()) {
            trace!(hash = %cert.hash(), "Certificate already cached");
            return false;
        }

        if capacity > 0 && self.certs.len() >= capacity {
            let hashes: Vec<&String> = self.certs.keys().collect();
            let victim = hashes[rand::thread_rng().gen_range(0..hashes.len())].clone();
            if let Some(evicted) = self.remove(&victim) {
                debug!(
                    capacity = capacity,
                    evicted = ?evicted.names(),
                    "Cache full; evicted random certificate"
                );
            }
        }

        for name in cert.names() {
            self.names
                .entry(name.clone())
                .or_default()
                .push(cert.hash().to_string());
        }
        self.certs.insert(cert.hash().to_string(), cert);
        true
    }

    fn remove(&mut self, hash: &str) -> Option<Certificate> {
        let cert = self.certs.remove(hash)?;
        for name in cert.names() {
            if let Some(hashes) = self.names.get_mut(name) {
                hashes.retain(|h| h != hash);
                if hashes.is_empty() {
                    self.names.remove(name);
                }
            }
        }
        Some(cert)
    }

    fn lookup(&self, name: &str) -> Vec<Certificate> {
        self.names
            .get(name)
            .map(|hashes| {
                hashes
                    .iter()
                    .filter_map(|hash| self.certs.get(hash).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Process-wide certificate cache
pub struct CertCache {
    index: RwLock<CacheIndex>,
    options: CacheOptions,
    jobs: JobPool,
    flights: SingleFlight,
    held_locks: Mutex<HashMap<String, Arc<dyn Storage>>>,
    maintenance: Mutex<Option<SupervisorHandle>>,
}

impl CertCache {
    pub fn new(options: CacheOptions) -> Self {
        info!(
            capacity = options.capacity,
            renew_check_interval_secs = options.renew_check_interval.as_secs(),
            ocsp_check_interval_secs = options.ocsp_check_interval.as_secs(),
            "Creating certificate cache"
        );
        Self {
            index: RwLock::new(CacheIndex::default()),
            jobs: JobPool::new(options.max_workers),
            flights: SingleFlight::new(),
            held_locks: Mutex::new(HashMap::new()),
            maintenance: Mutex::new(None),
            options,
        }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Pool running renewals and other background work
    pub fn jobs(&self) -> &JobPool {
        &self.jobs
    }

    /// Wait tokens for obtain and renew operations
    pub fn flights(&self) -> &SingleFlight {
        &self.flights
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Add a certificate, evicting a random one if at capacity.
    ///
    /// Returns false if the certificate was already cached or was refused.
    /// A certificate without names is refused and logged.
    pub fn insert(&self, cert: Certificate) -> bool {
        if cert.names().is_empty() {
            error!(
                hash = %cert.hash(),
                "Refusing to cache certificate with no subject names"
            );
            return false;
        }
        let inserted = self.index.write().insert(cert.clone(), self.options.capacity);
        if inserted {
            debug!(
                identifiers = ?cert.names(),
                hash = %cert.hash(),
                managed = cert.managed(),
                "Added certificate to cache"
            );
        }
        inserted
    }

    /// Remove a certificate and its name index entries
    pub fn remove(&self, cert: &Certificate) -> bool {
        let removed = self.index.write().remove(cert.hash()).is_some();
        if removed {
            debug!(identifiers = ?cert.names(), hash = %cert.hash(), "Removed certificate from cache");
        }
        removed
    }

    /// Remove certificates by hash under one lock
    pub fn remove_hashes(&self, hashes: &[String]) -> usize {
        let mut index = self.index.write();
        hashes.iter().filter(|hash| index.remove(hash).is_some()).count()
    }

    /// Swap `old` for `new` atomically with respect to readers
    pub fn replace(&self, old: &Certificate, new: Certificate) {
        let names = new.names().to_vec();
        let hash = new.hash().to_string();
        if names.is_empty() {
            error!(hash = %hash, "Refusing to cache replacement certificate with no subject names");
            return;
        }

        let mut index = self.index.write();
        index.remove(old.hash());
        index.insert(new, self.options.capacity);
        drop(index);

        info!(
            identifiers = ?names,
            old_hash = %old.hash(),
            new_hash = %hash,
            "Replaced certificate in cache"
        );
    }

    /// Drop managed certificates indexed under exactly these names,
    /// optionally only those from one issuer
    pub fn remove_managed(&self, names: &[String], issuer_key: Option<&str>) -> usize {
        let mut index = self.index.write();
        let mut doomed = HashSet::new();
        for name in names {
            for cert in index.lookup(name) {
                if !cert.managed() {
                    continue;
                }
                if issuer_key.is_none() || cert.issuer_key() == issuer_key {
                    doomed.insert(cert.hash().to_string());
                }
            }
        }
        doomed.iter().filter(|hash| index.remove(hash).is_some()).count()
    }

    /// Attach an OCSP response to the cached certificate with this hash
    pub fn set_ocsp(&self, hash: &str, response: OcspResponse) -> bool {
        match self.index.write().certs.get_mut(hash) {
            Some(cert) => {
                cert.set_ocsp(response);
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Certificates indexed under exactly `name`
    pub fn lookup_exact(&self, name: &str) -> Vec<Certificate> {
        self.index.read().lookup(name)
    }

    /// Alias of [`lookup_exact`](Self::lookup_exact)
    pub fn lookup_all(&self, name: &str) -> Vec<Certificate> {
        self.lookup_exact(name)
    }

    /// Exact matches followed by matches for `name` with one label at a
    /// time replaced by `*`, left to right.
    pub fn lookup_with_wildcards(&self, name: &str) -> Vec<Certificate> {
        let index = self.index.read();
        let mut found = index.lookup(name);

        let labels: Vec<&str> = name.split('.').collect();
        for i in 0..labels.len() {
            if labels[i] == "*" {
                continue;
            }
            let mut candidate = labels.clone();
            candidate[i] = "*";
            for cert in index.lookup(&candidate.join(".")) {
                if !found.iter().any(|c| c.hash() == cert.hash()) {
                    found.push(cert);
                }
            }
        }
        found
    }

    pub fn get_by_hash(&self, hash: &str) -> Option<Certificate> {
        self.index.read().certs.get(hash).cloned()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.index.read().certs.contains_key(hash)
    }

    /// Every cached certificate
    pub fn all(&self) -> Vec<Certificate> {
        self.index.read().certs.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over every certificate under the read lock and collect what
    /// it returns. `f` must not block or call back into the cache.
    pub fn scan<T>(&self, mut f: impl FnMut(&Certificate) -> Option<T>) -> Vec<T> {
        self.index.read().certs.values().filter_map(|c| f(c)).collect()
    }

    // =========================================================================
    // Held storage locks
    // =========================================================================

    pub(crate) fn track_lock(&self, name: &str, storage: Arc<dyn Storage>) {
        self.held_locks.lock().insert(name.to_string(), storage);
    }

    pub(crate) fn untrack_lock(&self, name: &str) {
        self.held_locks.lock().remove(name);
    }

    /// Names of storage locks currently held through this cache
    pub fn held_locks(&self) -> Vec<String> {
        self.held_locks.lock().keys().cloned().collect()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the maintenance loop. Must be called inside a Tokio runtime.
    ///
    /// `source` maps each certificate to the manager governing it. Calling
    /// this while maintenance is running does nothing.
    pub fn start_maintenance(self: &Arc<Self>, source: Arc<dyn ConfigSource>) {
        let mut slot = self.maintenance.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            warn!("Certificate maintenance already running");
            return;
        }

        let scheduler = Arc::new(MaintenanceScheduler::new(
            Arc::downgrade(self),
            source,
            self.options.renew_check_interval,
            self.options.ocsp_check_interval,
        ));
        *slot = Some(supervise(
            "certificate-maintenance",
            DEFAULT_MAX_RESTARTS,
            move |token| {
                let scheduler = Arc::clone(&scheduler);
                async move { scheduler.run(token).await }
            },
        ));
    }

    /// Stop the maintenance loop and release every storage lock held
    /// through this cache
    pub async fn stop(&self) {
        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
            info!("Certificate maintenance stopped");
        }

        let held: Vec<(String, Arc<dyn Storage>)> = self.held_locks.lock().drain().collect();
        for (name, storage) in held {
            match storage.unlock(&name).await {
                Ok(()) => info!(lock = %name, "Released lock during shutdown"),
                Err(e) => error!(lock = %name, error = %e, "Failed to release lock during shutdown"),
            }
        }
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let index = self.index.read();
        for (name, hashes) in &index.names {
            assert!(!hashes.is_empty(), "empty index entry for {name}");
            for hash in hashes {
                let cert = index.certs.get(hash).expect("indexed hash must be cached");
                assert!(cert.names().contains(name));
            }
        }
        for (hash, cert) in &index.certs {
            for name in cert.names() {
                assert!(index.names.get(name).is_some_and(|h| h.contains(hash)));
            }
        }
    }
}

impl Default for CertCache {
    fn default() -> Self {
        Self::new(CacheOptions::default())
    }
}

impl std::fmt::Debug for CertCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertCache")
            .field("len", &self.len())
            .field("capacity", &self.options.capacity)
            .field("jobs", &self.jobs)
            .field("held_locks", &self.held_locks.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use proptest::prelude::*;

    fn cert(names: &[&str], content: &str) -> Certificate {
        let now = Utc::now();
        Certificate::from_parts(
            names.iter().copied(),
            content.as_bytes(),
            now - ChronoDuration::days(1),
            now + ChronoDuration::days(60),
        )
    }

    fn cache(capacity: usize) -> CertCache {
        CertCache::new(CacheOptions {
            capacity,
            ..Default::default()
        })
    }

    #[test]
    fn test_insert_same_hash_twice() {
        let cache = cache(0);
        assert!(cache.insert(cert(&["a.example.com"], "a")));
        assert!(!cache.insert(cert(&["a.example.com"], "a")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_refuses_nameless_certificate() {
        let cache = cache(0);
        assert!(!cache.insert(cert(&[], "nameless")));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_multiple_certificates_per_name() {
        let cache = cache(0);
        cache.insert(cert(&["a.example.com"], "rsa"));
        cache.insert(cert(&["a.example.com", "b.example.com"], "ecdsa"));
        assert_eq!(cache.lookup_exact("a.example.com").len(), 2);
        assert_eq!(cache.lookup_all("b.example.com").len(), 1);
        assert!(cache.lookup_exact("c.example.com").is_empty());
    }

    #[test]
    fn test_remove_clears_index() {
        let cache = cache(0);
        let c = cert(&["a.example.com", "b.example.com"], "a");
        cache.insert(c.clone());
        assert!(cache.remove(&c));
        assert!(cache.lookup_exact("a.example.com").is_empty());
        assert!(cache.lookup_exact("b.example.com").is_empty());
        assert!(!cache.remove(&c));
        cache.assert_consistent();
    }

    #[test]
    fn test_capacity_evicts_one() {
        let cache = cache(2);
        cache.insert(cert(&["a.example.com"], "a"));
        cache.insert(cert(&["b.example.com"], "b"));
        cache.insert(cert(&["c.example.com"], "c"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup_exact("c.example.com").len(), 1);
        let survivors = cache.lookup_exact("a.example.com").len() + cache.lookup_exact("b.example.com").len();
        assert_eq!(survivors, 1);
        cache.assert_consistent();
    }

    #[test]
    fn test_wildcard_lookup() {
        let cache = cache(0);
        cache.insert(cert(&["*.example.com"], "wild"));
        cache.insert(cert(&["*.other.com"], "other"));
        cache.insert(cert(&["foo.*.com"], "middle"));

        let found = cache.lookup_with_wildcards("foo.example.com");
        let names: Vec<&str> = found.iter().map(|c| c.names()[0].as_str()).collect();
        assert_eq!(names, vec!["*.example.com", "foo.*.com"]);
        assert!(cache.lookup_with_wildcards("foo.bar.org").is_empty());
    }

    #[test]
    fn test_exact_matches_come_first() {
        let cache = cache(0);
        cache.insert(cert(&["*.example.com"], "wild"));
        cache.insert(cert(&["foo.example.com"], "exact"));
        let found = cache.lookup_with_wildcards("foo.example.com");
        assert_eq!(found[0].names()[0], "foo.example.com");
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_replace_is_atomic_swap() {
        let cache = cache(1);
        let old = cert(&["a.example.com"], "old");
        let new = cert(&["a.example.com"], "new");
        cache.insert(old.clone());
        cache.replace(&old, new.clone());

        assert_eq!(cache.len(), 1);
        assert!(!cache.contains(old.hash()));
        assert!(cache.contains(new.hash()));
        cache.assert_consistent();
    }

    #[test]
    fn test_remove_managed() {
        let cache = cache(0);
        cache.insert(cert(&["a.example.com"], "static"));
        cache.insert(cert(&["a.example.com"], "managed-1").with_managed(true).with_issuer_key("ca-1"));
        cache.insert(cert(&["a.example.com"], "managed-2").with_managed(true).with_issuer_key("ca-2"));

        assert_eq!(cache.remove_managed(&["a.example.com".to_string()], Some("ca-1")), 1);
        assert_eq!(cache.remove_managed(&["a.example.com".to_string()], None), 1);
        let left = cache.lookup_exact("a.example.com");
        assert_eq!(left.len(), 1);
        assert!(!left[0].managed());
    }

    #[test]
    fn test_scan_collects() {
        let cache = cache(0);
        cache.insert(cert(&["a"], "a").with_managed(true));
        cache.insert(cert(&["b"], "b"));
        let managed = cache.scan(|c| c.managed().then(|| c.names()[0].clone()));
        assert_eq!(managed, vec!["a".to_string()]);
    }

    proptest! {
        #[test]
        fn prop_index_stays_consistent(
            ops in prop::collection::vec((any::<bool>(), 0u8..16, prop::collection::vec(0u8..6, 1..4)), 1..80),
            capacity in 0usize..6,
        ) {
            let cache = cache(capacity);
            let mut inserted: Vec<Certificate> = Vec::new();

            for (is_insert, id, name_ids) in ops {
                let names: Vec<String> = name_ids.iter().map(|n| format!("host{n}.example.com")).collect();
                let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
                let c = cert(&name_refs, &format!("cert-{id}-{name_ids:?}"));
                if is_insert {
                    cache.insert(c.clone());
                    inserted.push(c);
                } else if let Some(victim) = inserted.get(id as usize % inserted.len().max(1)) {
                    cache.remove(victim);
                    prop_assert!(!cache.contains(victim.hash()));
                    for name in victim.names() {
                        prop_assert!(cache.lookup_exact(name).iter().all(|x| x.hash() != victim.hash()));
                    }
                }

                if capacity > 0 {
                    prop_assert!(cache.len() <= capacity);
                }
                cache.assert_consistent();
            }

            for c in cache.all() {
                for name in c.names() {
                    prop_assert!(cache.lookup_exact(name).iter().any(|x| x.hash() == c.hash()));
                }
            }
        }
    }
}
