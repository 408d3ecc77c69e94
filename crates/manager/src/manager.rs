//! Certificate manager.
//!
//! A [`CertManager`] binds a shared [`CertCache`] to the policy and
//! collaborators for one set of certificates: issuers, storage, key
//! generation, OCSP stapling, and the on-demand decision. It obtains,
//! renews, loads, and caches managed certificates; the handshake path
//! lives in [`crate::handshake`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use certward_common::{do_with_retry, JobError, OperationContext, RateLimitError, RateLimiterRegistry, RetryPolicy};
use certward_config::{Config, OcspConfig};
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::cache::CertCache;
use crate::certificate::{in_renewal_window, normalize_name, Certificate, ChainInfo};
use crate::error::{CertError, IssueError, OcspError, StorageError};
use crate::issuer::{CertificateRequest, EcdsaKeyGenerator, IssuedCertificate, Issuer, KeyGenerator};
use crate::maintenance::{clean_storage, CleanOptions, CleanReport, MaintenanceReport, MaintenanceScheduler};
use crate::ocsp::{staple_ocsp, OcspStapler, OcspStatus};
use crate::selection::CertificateSelector;
use crate::storage::{
    has_certificate, load_certificate, load_private_key, save_certificate, CertificateMeta,
    Storage, StoredCertificate,
};

/// Buffered events per subscriber before the oldest are dropped
const EVENT_CAPACITY: usize = 256;

/// Approves or rejects on-demand issuance for a name
pub type DecisionFn = Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

// ============================================================================
// On-demand policy
// ============================================================================

/// Which names may have certificates obtained during a handshake.
///
/// A decision function, when set, has the final say. Otherwise a
/// non-empty allow-list restricts issuance to its names; an empty one
/// allows every qualifying name.
#[derive(Clone, Default)]
pub struct OnDemandPolicy {
    allow: HashSet<String>,
    decision: Option<DecisionFn>,
}

impl OnDemandPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allow
            .extend(names.into_iter().map(|n| normalize_name(n.as_ref())));
        self
    }

    pub fn with_decision(
        mut self,
        decision: impl Fn(&str) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.decision = Some(Arc::new(decision));
        self
    }

    fn check(&self, name: &str) -> Result<(), String> {
        if let Some(decision) = &self.decision {
            return decision(name);
        }
        if !self.allow.is_empty() && !self.allow.contains(name) {
            return Err(format!("certificate for '{name}' is not managed"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for OnDemandPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnDemandPolicy")
            .field("allow", &self.allow)
            .field("decision", &self.decision.is_some())
            .finish()
    }
}

// ============================================================================
// Events
// ============================================================================

/// Lifecycle notifications broadcast to [`CertManager::subscribe`]rs
#[derive(Debug, Clone, PartialEq)]
pub enum CertEvent {
    TlsHandshakeStarted { server_name: String },
    TlsHandshakeCompleted { server_name: String, hash: String },
    CertObtaining { name: String },
    CertObtained { name: String, issuer: String },
    CertRenewed { name: String, issuer: String },
    CertFailed { name: String, renewal: bool, error: String },
    CachedManagedCert { names: Vec<String> },
    CachedUnmanagedCert { names: Vec<String> },
    CertRevokedReplaced { names: Vec<String> },
}

impl CertEvent {
    /// Stable event name
    pub fn name(&self) -> &'static str {
        match self {
            CertEvent::TlsHandshakeStarted { .. } => "tls_handshake_started",
            CertEvent::TlsHandshakeCompleted { .. } => "tls_handshake_completed",
            CertEvent::CertObtaining { .. } => "cert_obtaining",
            CertEvent::CertObtained { .. } => "cert_obtained",
            CertEvent::CertRenewed { .. } => "cert_renewed",
            CertEvent::CertFailed { .. } => "cert_failed",
            CertEvent::CachedManagedCert { .. } => "cached_managed_cert",
            CertEvent::CachedUnmanagedCert { .. } => "cached_unmanaged_cert",
            CertEvent::CertRevokedReplaced { .. } => "cert_revoked_replaced",
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Policy and collaborators for a [`CertManager`]
#[derive(Clone)]
pub struct ManagerConfig {
    /// Trailing fraction of a certificate's lifetime in which it is renewed
    pub renewal_window_ratio: f64,
    /// Served when a client sends no SNI and nothing matches its local IP
    pub default_server_name: Option<String>,
    /// Enables on-demand loading and issuance during handshakes
    pub on_demand: Option<OnDemandPolicy>,
    pub must_staple: bool,
    pub ocsp: OcspConfig,
    pub retry: RetryPolicy,
    /// Tried in order
    pub issuers: Vec<Arc<dyn Issuer>>,
    pub storage: Arc<dyn Storage>,
    pub key_generator: Arc<dyn KeyGenerator>,
    pub stapler: Option<Arc<dyn OcspStapler>>,
    /// Replaces the default selection rule when set
    pub selector: Option<Arc<dyn CertificateSelector>>,
    pub rate_limits: Arc<RateLimiterRegistry>,
}

impl ManagerConfig {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            renewal_window_ratio: certward_config::default_renewal_window_ratio(),
            default_server_name: None,
            on_demand: None,
            must_staple: false,
            ocsp: OcspConfig::default(),
            retry: RetryPolicy::default(),
            issuers: Vec::new(),
            storage,
            key_generator: Arc::new(EcdsaKeyGenerator),
            stapler: None,
            selector: None,
            rate_limits: Arc::new(RateLimiterRegistry::new(
                certward_config::default_rate_limit_events(),
                Duration::from_secs(certward_config::default_rate_limit_window()),
            )),
        }
    }

    /// Build from the file configuration; issuers and other runtime
    /// collaborators are attached afterwards with the `with_*` methods
    pub fn from_config(config: &Config, storage: Arc<dyn Storage>) -> Self {
        let mut manager = Self::new(storage);
        manager.renewal_window_ratio = config.renewal_window_ratio;
        manager.default_server_name = config.default_server_name.clone();
        manager.on_demand = config
            .on_demand
            .as_ref()
            .map(|on_demand| OnDemandPolicy::new().allow(&on_demand.allow));
        manager.must_staple = config.must_staple;
        manager.ocsp = config.ocsp.clone();
        manager.retry = RetryPolicy::default()
            .with_max_duration(Duration::from_secs(config.retry.max_duration_secs));
        manager.rate_limits = Arc::new(RateLimiterRegistry::new(
            config.rate_limit.max_events,
            Duration::from_secs(config.rate_limit.window_secs),
        ));
        manager
    }

    pub fn with_issuer(mut self, issuer: Arc<dyn Issuer>) -> Self {
        self.issuers.push(issuer);
        self
    }

    pub fn with_on_demand(mut self, policy: OnDemandPolicy) -> Self {
        self.on_demand = Some(policy);
        self
    }

    pub fn with_stapler(mut self, stapler: Arc<dyn OcspStapler>) -> Self {
        self.stapler = Some(stapler);
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn CertificateSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_key_generator(mut self, generator: Arc<dyn KeyGenerator>) -> Self {
        self.key_generator = generator;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limits(mut self, rate_limits: Arc<RateLimiterRegistry>) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    pub fn with_renewal_window_ratio(mut self, ratio: f64) -> Self {
        self.renewal_window_ratio = ratio;
        self
    }

    pub fn with_default_server_name(mut self, name: impl Into<String>) -> Self {
        self.default_server_name = Some(name.into());
        self
    }
}

impl std::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("renewal_window_ratio", &self.renewal_window_ratio)
            .field("default_server_name", &self.default_server_name)
            .field("on_demand", &self.on_demand)
            .field("must_staple", &self.must_staple)
            .field("issuers", &self.issuers.iter().map(|i| i.issuer_key()).collect::<Vec<_>>())
            .field("storage", &self.storage)
            .field("stapler", &self.stapler.is_some())
            .field("selector", &self.selector.is_some())
            .finish()
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Obtains, renews, and caches certificates under one [`ManagerConfig`]
pub struct CertManager {
    pub(crate) config: ManagerConfig,
    pub(crate) cache: Arc<CertCache>,
    events: broadcast::Sender<CertEvent>,
}

impl CertManager {
    pub fn new(cache: Arc<CertCache>, config: ManagerConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!(
            issuers = config.issuers.len(),
            on_demand = config.on_demand.is_some(),
            renewal_window_ratio = config.renewal_window_ratio,
            "Creating certificate manager"
        );
        Arc::new(Self {
            config,
            cache,
            events,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CertCache> {
        &self.cache
    }

    /// Receive lifecycle events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<CertEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: CertEvent) {
        debug!(event = event.name(), "Emitting certificate event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Start the cache's maintenance loop with this manager governing every
    /// certificate
    pub fn start_maintenance(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        self.cache
            .start_maintenance(Arc::new(move |_: &Certificate| manager.upgrade()));
    }

    /// Stop maintenance, release held locks, and stop the rate limiters
    pub async fn stop(&self) {
        self.cache.stop().await;
        self.config.rate_limits.stop_all();
    }

    /// Run one renewal pass now instead of waiting for the timer
    pub async fn renew_managed_certificates(
        self: &Arc<Self>,
        ctx: &OperationContext,
    ) -> MaintenanceReport {
        let manager = Arc::clone(self);
        let scheduler = MaintenanceScheduler::new(
            Arc::downgrade(&self.cache),
            Arc::new(move |_: &Certificate| Some(Arc::clone(&manager))),
            self.cache.options().renew_check_interval,
            self.cache.options().ocsp_check_interval,
        );
        scheduler.renew_managed_certificates(ctx).await
    }

    /// Remove expired certificates and staples from this manager's storage
    pub async fn clean_storage(&self, ctx: &OperationContext, options: CleanOptions) -> CleanReport {
        clean_storage(ctx, self.config.storage.as_ref(), &options).await
    }

    pub(crate) fn on_demand_enabled(&self) -> bool {
        self.config.on_demand.is_some()
    }

    // =========================================================================
    // Policy
    // =========================================================================

    /// Whether a certificate for `name` may be obtained on demand
    pub fn check_if_cert_should_be_obtained(&self, name: &str) -> Result<(), CertError> {
        let deny = |reason: String| CertError::PolicyDenied {
            name: name.to_string(),
            reason,
        };
        let Some(policy) = &self.config.on_demand else {
            return Err(deny("not configured for on-demand certificate issuance".to_string()));
        };
        if !subject_qualifies_for_cert(name) {
            return Err(deny(format!("subject name does not qualify for certificate: {name}")));
        }
        policy.check(name).map_err(deny)
    }

    // =========================================================================
    // Obtain and renew
    // =========================================================================

    /// Obtain a certificate for `name` and save it to storage.
    ///
    /// Does nothing if any issuer already has one stored. Interactive
    /// calls try once; others go through the Retry Coordinator. The cache
    /// is not updated.
    pub async fn obtain_cert(
        &self,
        ctx: &OperationContext,
        name: &str,
        interactive: bool,
    ) -> Result<(), CertError> {
        if self.config.issuers.is_empty() {
            return Err(CertError::NoIssuers);
        }
        let name = normalize_name(name);

        if self.storage_has_cert_any_issuer(&name).await {
            debug!(identifier = %name, "Certificate already exists in storage");
            return Ok(());
        }

        let lock = self.acquire_lock(ctx, &issue_lock_key(&name)).await?;

        let result = if interactive {
            self.obtain_once(ctx, &name).await
        } else {
            let name = name.as_str();
            do_with_retry(&self.config.retry, ctx, move |attempt| async move {
                self.obtain_once(&attempt, name).await
            })
            .await
            .map_err(CertError::from)
        };

        lock.release().await;
        result
    }

    async fn obtain_once(&self, ctx: &OperationContext, name: &str) -> Result<(), CertError> {
        // Another process may have finished while we waited for the lock
        if self.storage_has_cert_any_issuer(name).await {
            info!(identifier = %name, "Certificate already exists in storage");
            return Ok(());
        }

        info!(identifier = %name, attempt = ctx.attempts() + 1, "Obtaining certificate");
        self.emit(CertEvent::CertObtaining {
            name: name.to_string(),
        });

        let (key_pem, issuers) = self.reuse_private_key(name).await?;
        let (issued, issuer_key) = match self
            .issue_with_issuers(ctx, "obtaining", name, &key_pem, &issuers)
            .await
        {
            Ok(issued) => issued,
            Err(e) => {
                self.emit(CertEvent::CertFailed {
                    name: name.to_string(),
                    renewal: false,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        self.save_issued(name, key_pem, issued, &issuer_key).await?;
        info!(identifier = %name, issuer = %issuer_key, "Certificate obtained successfully");
        self.emit(CertEvent::CertObtained {
            name: name.to_string(),
            issuer: issuer_key,
        });
        Ok(())
    }

    /// Renew the stored certificate for `name`, reusing its private key.
    ///
    /// Skips renewal when the stored certificate is outside its renewal
    /// window unless `force` is set. The cache is not updated.
    pub async fn renew_cert(
        &self,
        ctx: &OperationContext,
        name: &str,
        force: bool,
        interactive: bool,
    ) -> Result<(), CertError> {
        if self.config.issuers.is_empty() {
            return Err(CertError::NoIssuers);
        }
        let name = normalize_name(name);

        let lock = self.acquire_lock(ctx, &issue_lock_key(&name)).await?;

        let result = if interactive {
            self.renew_once(ctx, &name, force).await
        } else {
            let name = name.as_str();
            do_with_retry(&self.config.retry, ctx, move |attempt| async move {
                self.renew_once(&attempt, name, force).await
            })
            .await
            .map_err(CertError::from)
        };

        lock.release().await;
        result
    }

    async fn renew_once(
        &self,
        ctx: &OperationContext,
        name: &str,
        force: bool,
    ) -> Result<(), CertError> {
        // A missing certificate will not appear by retrying
        let stored = self.load_cert_any_issuer(name).await.map_err(|e| {
            if e.is_not_found() {
                CertError::no_retry(e)
            } else {
                e
            }
        })?;

        let info = ChainInfo::from_pem(stored.cert_pem.as_bytes())?;
        let now = Utc::now();
        let needs_renewal = in_renewal_window(
            info.not_before,
            info.not_after,
            self.config.renewal_window_ratio,
            now,
        );
        if !needs_renewal {
            if !force {
                info!(
                    identifier = %name,
                    remaining_secs = (info.not_after - now).num_seconds(),
                    "Certificate appears to have been renewed already"
                );
                return Ok(());
            }
            info!(
                identifier = %name,
                remaining_secs = (info.not_after - now).num_seconds(),
                "Certificate does not need renewal, but renewal is being forced"
            );
        }

        info!(identifier = %name, attempt = ctx.attempts() + 1, "Renewing certificate");

        let issuers = self.config.issuers.clone();
        let (issued, issuer_key) = match self
            .issue_with_issuers(ctx, "renewing", name, &stored.key_pem, &issuers)
            .await
        {
            Ok(issued) => issued,
            Err(e) => {
                self.emit(CertEvent::CertFailed {
                    name: name.to_string(),
                    renewal: true,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        self.save_issued(name, stored.key_pem, issued, &issuer_key).await?;
        info!(identifier = %name, issuer = %issuer_key, "Certificate renewed successfully");
        self.emit(CertEvent::CertRenewed {
            name: name.to_string(),
            issuer: issuer_key,
        });
        Ok(())
    }

    /// Ask each issuer in turn; the first success wins. Every call waits on
    /// the issuer's rate limiter first.
    async fn issue_with_issuers(
        &self,
        ctx: &OperationContext,
        op: &'static str,
        name: &str,
        key_pem: &str,
        issuers: &[Arc<dyn Issuer>],
    ) -> Result<(IssuedCertificate, String), CertError> {
        let request = CertificateRequest {
            names: vec![name.to_string()],
            private_key_pem: key_pem.to_string(),
            must_staple: self.config.must_staple,
        };

        let mut last_err = None;
        for (i, issuer) in issuers.iter().enumerate() {
            let issuer_key = issuer.issuer_key();
            debug!(
                identifier = %name,
                issuer = %issuer_key,
                position = i + 1,
                total = issuers.len(),
                "Trying issuer"
            );

            let (authority, account) = issuer.rate_limit_key();
            let limiter = self.config.rate_limits.get(&authority, &account);
            if let Err(e) = limiter.wait(ctx).await {
                return Err(match e {
                    RateLimitError::Context(reason) => CertError::Cancelled(reason),
                    RateLimitError::Stopped => CertError::Issuance {
                        op,
                        name: name.to_string(),
                        issuer: issuer_key,
                        source: IssueError::Transient(e.to_string()),
                    },
                });
            }

            match issuer.issue(ctx, &request).await {
                Ok(issued) => return Ok((issued, issuer_key)),
                Err(e) => {
                    error!(
                        identifier = %name,
                        issuer = %issuer_key,
                        error = %e,
                        "Could not get certificate from issuer"
                    );
                    last_err = Some(CertError::Issuance {
                        op,
                        name: name.to_string(),
                        issuer: issuer_key,
                        source: e,
                    });
                }
            }
        }
        Err(last_err.unwrap_or(CertError::NoIssuers))
    }

    async fn save_issued(
        &self,
        name: &str,
        key_pem: String,
        issued: IssuedCertificate,
        issuer_key: &str,
    ) -> Result<(), CertError> {
        let info = ChainInfo::from_pem(issued.certificate_pem.as_bytes())
            .map_err(CertError::no_retry)?;
        let stored = StoredCertificate {
            cert_pem: issued.certificate_pem,
            key_pem,
            meta: CertificateMeta {
                names: vec![name.to_string()],
                issued: info.not_before,
                expires: info.not_after,
                issuer_key: issuer_key.to_string(),
                issuer_data: issued.metadata,
            },
        };
        save_certificate(self.config.storage.as_ref(), name, &stored).await?;
        Ok(())
    }

    /// The stored private key for `name` if any issuer has one, with that
    /// issuer moved to the front; otherwise a freshly generated key
    async fn reuse_private_key(
        &self,
        name: &str,
    ) -> Result<(String, Vec<Arc<dyn Issuer>>), CertError> {
        let mut issuers = self.config.issuers.clone();
        for i in 0..issuers.len() {
            let issuer_key = issuers[i].issuer_key();
            match load_private_key(self.config.storage.as_ref(), &issuer_key, name).await {
                Ok(key_pem) => {
                    debug!(identifier = %name, issuer = %issuer_key, "Reusing stored private key");
                    let preferred = issuers.remove(i);
                    issuers.insert(0, preferred);
                    return Ok((key_pem, issuers));
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok((self.config.key_generator.generate()?, issuers))
    }

    async fn storage_has_cert_any_issuer(&self, name: &str) -> bool {
        for issuer in &self.config.issuers {
            if has_certificate(self.config.storage.as_ref(), &issuer.issuer_key(), name).await {
                return true;
            }
        }
        false
    }

    /// Newest stored certificate for `name` across all issuers
    pub(crate) async fn load_cert_any_issuer(
        &self,
        name: &str,
    ) -> Result<StoredCertificate, CertError> {
        if self.config.issuers.is_empty() {
            return Err(CertError::NoIssuers);
        }

        let mut newest: Option<StoredCertificate> = None;
        let mut last_err = None;
        for issuer in &self.config.issuers {
            let issuer_key = issuer.issuer_key();
            match load_certificate(self.config.storage.as_ref(), &issuer_key, name).await {
                Ok(stored) => {
                    if newest
                        .as_ref()
                        .map_or(true, |n| stored.meta.issued > n.meta.issued)
                    {
                        newest = Some(stored);
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(identifier = %name, issuer = %issuer_key, error = %e, "Loading stored certificate");
                    last_err = Some(e);
                }
            }
        }

        newest.ok_or_else(|| {
            last_err
                .unwrap_or_else(|| StorageError::NotFound(format!("certificate for '{name}'")))
                .into()
        })
    }

    async fn acquire_lock(&self, ctx: &OperationContext, key: &str) -> Result<IssueLock, CertError> {
        info!(lock = %key, "Acquiring lock");
        self.config.storage.lock(ctx, key).await?;
        self.cache.track_lock(key, Arc::clone(&self.config.storage));
        info!(lock = %key, "Lock acquired");
        Ok(IssueLock {
            key: key.to_string(),
            cache: Arc::clone(&self.cache),
            storage: Arc::clone(&self.config.storage),
            held: true,
        })
    }

    // =========================================================================
    // Loading and caching
    // =========================================================================

    /// Load the newest stored certificate for `name` and staple it. The
    /// cache is not touched.
    pub async fn load_managed_certificate(
        &self,
        ctx: &OperationContext,
        name: &str,
    ) -> Result<Certificate, CertError> {
        let name = normalize_name(name);
        let stored = self.load_cert_any_issuer(&name).await?;
        let mut cert = Certificate::from_pem(stored.cert_pem.as_bytes(), stored.key_pem.as_bytes())?
            .with_managed(true)
            .with_issuer_key(stored.meta.issuer_key.clone());

        if let Err(e) = self
            .staple_with_pem(ctx, &mut cert, Some(stored.cert_pem.as_bytes()))
            .await
        {
            warn!(identifiers = ?cert.names(), error = %e, "Stapling OCSP");
        }
        Ok(cert)
    }

    /// Load `name` from storage and add it to the cache as managed
    pub async fn cache_managed_certificate(
        &self,
        ctx: &OperationContext,
        name: &str,
    ) -> Result<Certificate, CertError> {
        let cert = self.load_managed_certificate(ctx, name).await?;
        self.cache.insert(cert.clone());
        self.emit(CertEvent::CachedManagedCert {
            names: cert.names().to_vec(),
        });
        Ok(cert)
    }

    /// Replace `old` in the cache with the newest stored copy
    pub async fn reload_managed_certificate(
        &self,
        ctx: &OperationContext,
        old: &Certificate,
    ) -> Result<Certificate, CertError> {
        let name = old.names().first().ok_or(CertError::NoNames)?;
        debug!(identifiers = ?old.names(), "Reloading managed certificate");
        let new = self.load_managed_certificate(ctx, name).await?;
        self.cache.replace(old, new.clone());
        Ok(new)
    }

    /// Parse a user-supplied certificate and cache it unmanaged. Returns
    /// its hash.
    pub async fn cache_unmanaged_pem(
        &self,
        ctx: &OperationContext,
        chain_pem: &[u8],
        key_pem: &[u8],
        tags: Vec<String>,
    ) -> Result<String, CertError> {
        let mut cert = Certificate::from_pem(chain_pem, key_pem)?.with_tags(tags);
        if let Err(e) = self.staple_with_pem(ctx, &mut cert, Some(chain_pem)).await {
            warn!(identifiers = ?cert.names(), error = %e, "Stapling OCSP");
        }
        let hash = cert.hash().to_string();
        let names = cert.names().to_vec();
        if !self.cache.insert(cert) && !self.cache.contains(&hash) {
            return Err(CertError::NoNames);
        }
        self.emit(CertEvent::CachedUnmanagedCert { names });
        Ok(hash)
    }

    /// Refresh the OCSP staple on `cert`. Returns false when stapling is
    /// disabled or no stapler is configured.
    pub async fn staple_ocsp(
        &self,
        ctx: &OperationContext,
        cert: &mut Certificate,
    ) -> Result<bool, OcspError> {
        self.staple_with_pem(ctx, cert, None).await
    }

    async fn staple_with_pem(
        &self,
        ctx: &OperationContext,
        cert: &mut Certificate,
        pem: Option<&[u8]>,
    ) -> Result<bool, OcspError> {
        if self.config.ocsp.disable_stapling {
            return Ok(false);
        }
        let Some(stapler) = &self.config.stapler else {
            return Ok(false);
        };
        staple_ocsp(ctx, self.config.storage.as_ref(), stapler.as_ref(), cert, pem).await?;
        Ok(true)
    }

    // =========================================================================
    // Managing names
    // =========================================================================

    /// Load or obtain a certificate for each name and cache it, renewing
    /// when due. Runs in the foreground and stops at the first failure.
    pub async fn manage_sync<S: AsRef<str>>(
        self: &Arc<Self>,
        ctx: &OperationContext,
        names: &[S],
    ) -> Result<(), CertError> {
        for name in names {
            self.manage_one(ctx, name.as_ref(), false).await?;
        }
        Ok(())
    }

    /// Like [`manage_sync`](Self::manage_sync), but obtaining and renewing
    /// happen as background jobs with retries. Loading from storage still
    /// happens before returning.
    pub async fn manage_async<S: AsRef<str>>(
        self: &Arc<Self>,
        ctx: &OperationContext,
        names: &[S],
    ) -> Result<(), CertError> {
        for name in names {
            self.manage_one(ctx, name.as_ref(), true).await?;
        }
        Ok(())
    }

    async fn manage_one(
        self: &Arc<Self>,
        ctx: &OperationContext,
        name: &str,
        background: bool,
    ) -> Result<(), CertError> {
        let name = normalize_name(name);
        if !subject_qualifies_for_cert(&name) {
            return Err(CertError::PolicyDenied {
                reason: format!("subject name does not qualify for certificate: {name}"),
                name,
            });
        }

        if self.cache.lookup_exact(&name).iter().any(Certificate::managed) {
            debug!(identifier = %name, "Certificate already managed");
            return Ok(());
        }

        let cert = match self.cache_managed_certificate(ctx, &name).await {
            Ok(cert) => cert,
            Err(e) if e.is_not_found() => {
                if !background {
                    return self.obtain_and_cache(ctx, &name, true).await;
                }
                let manager = Arc::clone(self);
                let ctx = ctx.clone();
                self.cache.jobs().submit("", async move {
                    manager
                        .obtain_and_cache(&ctx, &name, false)
                        .await
                        .map_err(JobError::failed)
                });
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !background {
            return self.renew_cached(ctx, &cert, true).await;
        }
        let manager = Arc::clone(self);
        let ctx = ctx.clone();
        self.cache.jobs().submit(format!("renew_{name}"), async move {
            manager
                .renew_cached(&ctx, &cert, false)
                .await
                .map_err(JobError::failed)
        });
        Ok(())
    }

    async fn obtain_and_cache(
        &self,
        ctx: &OperationContext,
        name: &str,
        interactive: bool,
    ) -> Result<(), CertError> {
        self.obtain_cert(ctx, name, interactive).await?;
        self.cache_managed_certificate(ctx, name).await?;
        Ok(())
    }

    /// Renew a freshly cached certificate if it is revoked or due
    async fn renew_cached(
        &self,
        ctx: &OperationContext,
        cert: &Certificate,
        interactive: bool,
    ) -> Result<(), CertError> {
        let name = cert.names().first().ok_or(CertError::NoNames)?;
        let now = Utc::now();

        let revoked = !cert.expired(now)
            && cert
                .ocsp()
                .is_some_and(|response| response.status == OcspStatus::Revoked);
        if revoked && self.config.ocsp.replace_revoked {
            warn!(identifier = %name, "Certificate is revoked; forcing renewal");
            self.renew_cert(ctx, name, true, interactive).await?;
            self.reload_managed_certificate(ctx, cert).await?;
            self.emit(CertEvent::CertRevokedReplaced {
                names: cert.names().to_vec(),
            });
            return Ok(());
        }

        if !cert.needs_renewal(self.config.renewal_window_ratio, now) {
            return Ok(());
        }
        self.renew_cert(ctx, name, false, interactive).await?;
        self.reload_managed_certificate(ctx, cert).await?;
        Ok(())
    }

    /// Drop managed certificates for these names from the cache
    pub fn unmanage<S: AsRef<str>>(&self, names: &[S]) -> usize {
        let names: Vec<String> = names.iter().map(|n| normalize_name(n.as_ref())).collect();
        let removed = self.cache.remove_managed(&names, None);
        info!(identifiers = ?names, removed = removed, "Stopped managing certificates");
        removed
    }
}

impl std::fmt::Debug for CertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertManager")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish()
    }
}

/// A held issuance lock.
///
/// Dropped without [`release`](Self::release), e.g. when the owning future
/// is cancelled, it stops tracking the lock at once and unlocks storage on
/// a spawned task.
struct IssueLock {
    key: String,
    cache: Arc<CertCache>,
    storage: Arc<dyn Storage>,
    held: bool,
}

impl IssueLock {
    async fn release(mut self) {
        self.cache.untrack_lock(&self.key);
        match self.storage.unlock(&self.key).await {
            Ok(()) => info!(lock = %self.key, "Lock released"),
            Err(e) => error!(lock = %self.key, error = %e, "Unable to unlock"),
        }
        self.held = false;
    }
}

impl Drop for IssueLock {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        self.cache.untrack_lock(&self.key);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.key, "No async runtime; lock left to go stale");
            return;
        };
        let storage = Arc::clone(&self.storage);
        let key = std::mem::take(&mut self.key);
        warn!(lock = %key, "Operation abandoned while holding lock; releasing");
        handle.spawn(async move {
            if let Err(e) = storage.unlock(&key).await {
                error!(lock = %key, error = %e, "Unable to unlock abandoned lock");
            }
        });
    }
}

/// Storage lock guarding issuance for one name
pub(crate) fn issue_lock_key(name: &str) -> String {
    format!("issue_cert_{name}")
}

/// Whether `subject` can appear on a publicly issued certificate.
///
/// Rejects empty names, names with leading or trailing dots, spaces, empty
/// labels, wildcards anywhere but the full left-most label, and characters
/// that never appear in host names.
pub fn subject_qualifies_for_cert(subject: &str) -> bool {
    let subject = subject.trim();
    if subject.is_empty()
        || subject.starts_with('.')
        || subject.ends_with('.')
        || subject.contains(' ')
        || subject.contains("..")
    {
        return false;
    }

    let wildcards = subject.matches('*').count();
    if wildcards > 1 || (wildcards == 1 && !subject.starts_with("*.")) {
        return false;
    }

    !subject.chars().any(|c| {
        matches!(
            c,
            '(' | ')' | '[' | ']' | '{' | '}' | '<' | '>' | '\\' | '/' | ',' | ';' | '\'' | '"'
                | '@' | '%' | '!' | '^' | '&' | '#' | '$' | '=' | '+' | '|' | '?' | '`' | '~'
        )
    })
}
