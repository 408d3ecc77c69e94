//! Background certificate maintenance.
//!
//! Two fixed-interval timers drive one loop: a renewal check and an OCSP
//! check. Each pass scans the cache under its read lock to build a work
//! list, releases the lock, and only then touches storage, issuers, or
//! responders. Renewals run on the cache's job pool, named by the
//! certificate's primary name so a certificate is never renewed twice at
//! once.
//!
//! [`clean_storage`] is separate: it prunes expired certificates and
//! staples from a storage backend.

use std::sync::{Arc, Weak};
use std::time::Duration;

use certward_common::{JobError, OperationContext};
use chrono::Utc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CertCache;
use crate::certificate::{in_renewal_window, Certificate, ChainInfo};
use crate::error::CertError;
use crate::manager::{CertEvent, CertManager};
use crate::ocsp::{OcspResponse, OcspStatus};
use crate::storage::{Storage, StorageKeys};

/// Shortest timer period accepted; zero would spin
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Default time an expired certificate is kept before cleanup
pub const DEFAULT_EXPIRED_CERT_GRACE_PERIOD: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Maps a cached certificate to the manager governing it
pub trait ConfigSource: Send + Sync {
    fn config_for(&self, cert: &Certificate) -> Option<Arc<CertManager>>;
}

impl<F> ConfigSource for F
where
    F: Fn(&Certificate) -> Option<Arc<CertManager>> + Send + Sync,
{
    fn config_for(&self, cert: &Certificate) -> Option<Arc<CertManager>> {
        self(cert)
    }
}

/// What one renewal pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Entries dropped because they had no names
    pub removed: usize,
    /// Certificates replaced by a newer copy already in storage
    pub reloaded: usize,
    /// Renewal jobs submitted
    pub queued: usize,
}

/// What one OCSP pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OcspReport {
    pub updated: usize,
    pub revoked: usize,
}

enum Scanned {
    Nameless(String),
    Due(Certificate, Arc<CertManager>),
}

// ============================================================================
// Scheduler
// ============================================================================

/// Drives renewal and OCSP checks for one cache
pub struct MaintenanceScheduler {
    cache: Weak<CertCache>,
    source: Arc<dyn ConfigSource>,
    renew_interval: Duration,
    ocsp_interval: Duration,
}

impl MaintenanceScheduler {
    pub fn new(
        cache: Weak<CertCache>,
        source: Arc<dyn ConfigSource>,
        renew_interval: Duration,
        ocsp_interval: Duration,
    ) -> Self {
        Self {
            cache,
            source,
            renew_interval: renew_interval.max(MIN_INTERVAL),
            ocsp_interval: ocsp_interval.max(MIN_INTERVAL),
        }
    }

    /// Run until `token` is cancelled or the cache is dropped. The first
    /// tick of each timer comes one full period after start.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let ctx = OperationContext::new();
        let start = Instant::now();
        let mut renew = interval_at(start + self.renew_interval, self.renew_interval);
        let mut ocsp = interval_at(start + self.ocsp_interval, self.ocsp_interval);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ocsp.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            renew_interval_secs = self.renew_interval.as_secs(),
            ocsp_interval_secs = self.ocsp_interval.as_secs(),
            "Certificate maintenance started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    ctx.cancel();
                    debug!("Certificate maintenance loop exiting");
                    return;
                }
                _ = renew.tick() => {
                    let report = self.renew_managed_certificates(&ctx).await;
                    debug!(
                        removed = report.removed,
                        reloaded = report.reloaded,
                        queued = report.queued,
                        "Renewal check finished"
                    );
                }
                _ = ocsp.tick() => {
                    let report = self.update_ocsp_staples(&ctx).await;
                    debug!(updated = report.updated, revoked = report.revoked, "OCSP check finished");
                }
            }

            if self.cache.strong_count() == 0 {
                ctx.cancel();
                info!("Certificate cache dropped; maintenance exiting");
                return;
            }
        }
    }

    /// Classify every managed certificate, then reload or queue renewal
    /// for those in their renewal window.
    ///
    /// A certificate whose stored copy is already outside the window was
    /// renewed elsewhere (another process sharing storage) and is only
    /// reloaded. This check is best-effort; renewal itself re-checks under
    /// the issuance lock.
    pub async fn renew_managed_certificates(&self, ctx: &OperationContext) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let Some(cache) = self.cache.upgrade() else {
            return report;
        };

        let now = Utc::now();
        let scanned = cache.scan(|cert| {
            if !cert.managed() {
                return None;
            }
            if cert.names().is_empty() {
                return Some(Scanned::Nameless(cert.hash().to_string()));
            }
            let manager = self.source.config_for(cert)?;
            if !cert.needs_renewal(manager.config().renewal_window_ratio, now) {
                return None;
            }
            Some(Scanned::Due(cert.clone(), manager))
        });

        let mut nameless = Vec::new();
        let mut due = Vec::new();
        for entry in scanned {
            match entry {
                Scanned::Nameless(hash) => nameless.push(hash),
                Scanned::Due(cert, manager) => due.push((cert, manager)),
            }
        }

        if !nameless.is_empty() {
            error!(count = nameless.len(), "Removing managed certificates with no names from cache");
            report.removed = cache.remove_hashes(&nameless);
        }

        for (cert, manager) in due {
            let name = cert.names()[0].clone();

            let stored_due = match manager.load_cert_any_issuer(&name).await {
                Ok(stored) => match ChainInfo::from_pem(stored.cert_pem.as_bytes()) {
                    Ok(info) => in_renewal_window(
                        info.not_before,
                        info.not_after,
                        manager.config().renewal_window_ratio,
                        now,
                    ),
                    Err(e) => {
                        warn!(identifier = %name, error = %e, "Stored certificate is unreadable; renewing");
                        true
                    }
                },
                Err(e) => {
                    error!(identifier = %name, error = %e, "Checking stored certificate before renewal");
                    continue;
                }
            };

            if !stored_due {
                info!(identifier = %name, "Certificate in storage is newer; reloading");
                match manager.reload_managed_certificate(ctx, &cert).await {
                    Ok(_) => report.reloaded += 1,
                    Err(e) => error!(identifier = %name, error = %e, "Reloading certificate"),
                }
                continue;
            }

            info!(
                identifier = %name,
                remaining_secs = cert.time_remaining(now).num_seconds(),
                "Certificate expires soon; queuing for renewal"
            );
            let job = renew_job(Arc::clone(&cache), manager, ctx.clone(), cert, false);
            if cache.jobs().submit(format!("renew_{name}"), job) {
                report.queued += 1;
            }
        }

        report
    }

    /// Refresh staples past their midpoint and queue replacement of
    /// revoked managed certificates
    pub async fn update_ocsp_staples(&self, ctx: &OperationContext) -> OcspReport {
        let mut report = OcspReport::default();
        let Some(cache) = self.cache.upgrade() else {
            return report;
        };

        let now = Utc::now();
        let due = cache.scan(|cert| {
            if cert.expired(now) {
                return None;
            }
            if cert
                .ocsp()
                .is_some_and(|response| response.is_fresh(cert.not_after(), now))
            {
                return None;
            }
            let manager = self.source.config_for(cert)?;
            Some((cert.clone(), manager))
        });

        let mut updates: Vec<(Certificate, OcspResponse, Arc<CertManager>)> = Vec::new();
        for (cert, manager) in due {
            let mut refreshed = cert.clone();
            match manager.staple_ocsp(ctx, &mut refreshed).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    if cert.ocsp().is_some() {
                        // Only worth a warning when a staple is going stale
                        warn!(identifiers = ?cert.names(), error = %e, "Cannot refresh OCSP staple");
                    } else {
                        debug!(identifiers = ?cert.names(), error = %e, "No OCSP staple available");
                    }
                    continue;
                }
            }

            let Some(response) = refreshed.ocsp().cloned() else {
                continue;
            };
            if cert.ocsp().is_some_and(|old| old.raw == response.raw) {
                continue;
            }
            updates.push((cert, response, manager));
        }

        for (cert, response, manager) in updates {
            let revoked = response.status == OcspStatus::Revoked;
            if cache.set_ocsp(cert.hash(), response) {
                report.updated += 1;
            }
            if !revoked {
                continue;
            }

            if !cert.managed() || !manager.config().ocsp.replace_revoked {
                warn!(identifiers = ?cert.names(), "Certificate is revoked; not replacing it");
                continue;
            }
            let Some(name) = cert.names().first().cloned() else {
                continue;
            };
            warn!(identifier = %name, "Certificate is revoked; queuing replacement");
            let job = renew_job(Arc::clone(&cache), manager, ctx.clone(), cert, true);
            if cache.jobs().submit(format!("renew_{name}"), job) {
                report.revoked += 1;
            }
        }

        report
    }
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler")
            .field("renew_interval", &self.renew_interval)
            .field("ocsp_interval", &self.ocsp_interval)
            .finish()
    }
}

/// Renew `cert` in the background and swap the result into the cache.
///
/// A failed renewal drops on-demand and revoked certificates from the
/// cache so the next handshake gets them reissued.
async fn renew_job(
    cache: Arc<CertCache>,
    manager: Arc<CertManager>,
    ctx: OperationContext,
    cert: Certificate,
    revoked: bool,
) -> Result<(), JobError> {
    let Some(name) = cert.names().first() else {
        return Err(JobError::failed(CertError::NoNames));
    };

    if let Err(e) = manager.renew_cert(&ctx, name, revoked, false).await {
        if revoked || manager.on_demand_enabled() {
            cache.remove(&cert);
        }
        return Err(JobError::failed(e));
    }

    manager
        .reload_managed_certificate(&ctx, &cert)
        .await
        .map_err(|e| JobError::failed(CertError::no_retry(e)))?;

    if revoked {
        manager.emit(CertEvent::CertRevokedReplaced {
            names: cert.names().to_vec(),
        });
    }
    Ok(())
}

// ============================================================================
// Storage cleanup
// ============================================================================

/// What [`clean_storage`] should remove
#[derive(Debug, Clone)]
pub struct CleanOptions {
    pub ocsp_staples: bool,
    pub expired_certs: bool,
    /// How long past expiry a certificate is kept
    pub grace_period: Duration,
}

impl Default for CleanOptions {
    fn default() -> Self {
        Self {
            ocsp_staples: true,
            expired_certs: true,
            grace_period: DEFAULT_EXPIRED_CERT_GRACE_PERIOD,
        }
    }
}

/// What [`clean_storage`] removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub staples_deleted: usize,
    pub certificates_deleted: usize,
    pub sites_deleted: usize,
}

/// Delete corrupt or expired OCSP staples and certificates expired for
/// longer than the grace period. Failures are logged, not returned.
pub async fn clean_storage(
    ctx: &OperationContext,
    storage: &dyn Storage,
    options: &CleanOptions,
) -> CleanReport {
    let mut report = CleanReport::default();

    if options.ocsp_staples {
        if let Err(e) = delete_old_ocsp_staples(ctx, storage, &mut report).await {
            error!(error = %e, "Deleting old OCSP staples");
        }
    }
    if options.expired_certs {
        if let Err(e) = delete_expired_certs(ctx, storage, options.grace_period, &mut report).await {
            error!(error = %e, "Deleting expired certificates");
        }
    }

    info!(
        staples_deleted = report.staples_deleted,
        certificates_deleted = report.certificates_deleted,
        sites_deleted = report.sites_deleted,
        "Storage cleaned"
    );
    report
}

async fn delete_old_ocsp_staples(
    ctx: &OperationContext,
    storage: &dyn Storage,
    report: &mut CleanReport,
) -> Result<(), CertError> {
    // Nothing stapled yet
    let Ok(keys) = storage.list(StorageKeys::OCSP, false).await else {
        return Ok(());
    };

    let now = Utc::now();
    for key in keys {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        let raw = match storage.load(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(key = %key, error = %e, "Loading OCSP staple for cleanup");
                continue;
            }
        };

        let stale = match serde_json::from_slice::<OcspResponse>(&raw) {
            Ok(response) => response.next_update.is_some_and(|next| now > next),
            Err(_) => true,
        };
        if !stale {
            continue;
        }

        match storage.delete(&key).await {
            Ok(()) => {
                debug!(key = %key, "Deleted stale OCSP staple");
                report.staples_deleted += 1;
            }
            Err(e) => error!(key = %key, error = %e, "Deleting stale OCSP staple"),
        }
    }
    Ok(())
}

async fn delete_expired_certs(
    ctx: &OperationContext,
    storage: &dyn Storage,
    grace_period: Duration,
    report: &mut CleanReport,
) -> Result<(), CertError> {
    let Ok(issuer_keys) = storage.list(StorageKeys::CERTIFICATES, false).await else {
        return Ok(());
    };

    let grace = chrono::Duration::from_std(grace_period).unwrap_or(chrono::Duration::MAX);
    let now = Utc::now();

    for issuer_key in issuer_keys {
        let site_keys = match storage.list(&issuer_key, false).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(key = %issuer_key, error = %e, "Listing issuer certificates");
                continue;
            }
        };

        for site_key in site_keys {
            if let Some(reason) = ctx.err() {
                return Err(reason.into());
            }

            let assets = match storage.list(&site_key, false).await {
                Ok(assets) => assets,
                Err(e) => {
                    error!(key = %site_key, error = %e, "Listing site assets");
                    continue;
                }
            };

            for asset in assets.iter().filter(|key| key.ends_with(".crt")) {
                let info = match storage.load(asset).await {
                    Ok(pem) => ChainInfo::from_pem(&pem),
                    Err(e) => Err(e.into()),
                };
                let info = match info {
                    Ok(info) => info,
                    Err(e) => {
                        error!(key = %asset, error = %e, "Reading certificate for cleanup");
                        continue;
                    }
                };
                let expired_for = now - info.not_after;
                if expired_for < grace {
                    continue;
                }

                info!(
                    key = %asset,
                    expired_for_secs = expired_for.num_seconds(),
                    "Certificate expired; cleaning up"
                );
                let base = asset.strip_suffix(".crt").unwrap_or(asset);
                for related in [asset.clone(), format!("{base}.key"), format!("{base}.json")] {
                    if let Err(e) = storage.delete(&related).await {
                        error!(key = %related, error = %e, "Deleting expired certificate asset");
                    }
                }
                report.certificates_deleted += 1;
            }

            let empty = match storage.list(&site_key, false).await {
                Ok(remaining) => remaining.is_empty(),
                Err(e) => e.is_not_found(),
            };
            if empty {
                debug!(key = %site_key, "Deleting empty site folder");
                match storage.delete(&site_key).await {
                    Ok(()) => report.sites_deleted += 1,
                    Err(e) => error!(key = %site_key, error = %e, "Deleting empty site folder"),
                }
            }
        }
    }
    Ok(())
}
