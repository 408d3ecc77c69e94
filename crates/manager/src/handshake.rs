//! Handshake-time certificate resolution.
//!
//! [`CertManager::get_certificate`] walks the on-demand state machine for
//! one client hello:
//!
//! 1. cache hit: serve it, renewing or re-stapling first when due
//! 2. cache miss with on-demand enabled: load from storage (exact name,
//!    then the first label replaced by `*`)
//! 3. still missing and issuance allowed: obtain through a per-name
//!    single flight, then load again
//! 4. otherwise the default certificate, if one matched, or an error
//!
//! A certificate with time left is renewed in the background while the
//! current one keeps being served; only an expired certificate makes the
//! handshake wait for renewal.

use std::sync::Arc;
use std::time::Duration;

use certward_common::OperationContext;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::certificate::{normalize_name, Certificate};
use crate::error::CertError;
use crate::manager::{CertEvent, CertManager};
use crate::selection::{CertificateSelector, ClientHelloInfo, DefaultSelector};
use crate::singleflight::{Flight, FlightGuard, FlightOutcome};

/// Longest a handshake waits on another task's obtain or renewal
const FLIGHT_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Budget for an obtain or renewal the handshake is blocked on
const BLOCKING_ISSUANCE_TIMEOUT: Duration = Duration::from_secs(90);

/// Budget for a renewal running behind a still-valid certificate
const BACKGROUND_RENEWAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Budget for re-stapling during a handshake
const HANDSHAKE_OCSP_TIMEOUT: Duration = Duration::from_secs(10);

/// How a certificate was found in the cache
#[derive(Debug, Clone)]
pub enum CacheHit {
    /// Matched the SNI (exactly, by wildcard, or by hash) or the local IP
    Matched(Certificate),
    /// Only the configured default server name matched
    Defaulted(Certificate),
}

impl CertManager {
    /// Resolve the certificate to serve for `hello`
    pub async fn get_certificate(
        self: &Arc<Self>,
        hello: &ClientHelloInfo,
    ) -> Result<Certificate, CertError> {
        let server_name = hello.name();
        self.emit(CertEvent::TlsHandshakeStarted {
            server_name: server_name.clone(),
        });

        let cert = self.get_cert_during_handshake(hello, true, true).await?;

        self.emit(CertEvent::TlsHandshakeCompleted {
            server_name,
            hash: cert.hash().to_string(),
        });
        Ok(cert)
    }

    /// Look `hello` up in the cache without touching storage or issuers.
    ///
    /// Without SNI the local IP is tried, then the default server name.
    /// With SNI: exact and wildcard matches, then a cached certificate
    /// whose hash equals the SNI.
    pub fn get_certificate_from_cache(&self, hello: &ClientHelloInfo) -> Option<CacheHit> {
        let name = hello.normalized_server_name();

        if name.is_empty() {
            if let Some(ip) = hello.local_ip() {
                if let Some(cert) = self.select(hello, self.cache.lookup_exact(&ip)) {
                    return Some(CacheHit::Matched(cert));
                }
            }
            if let Some(default) = &self.config.default_server_name {
                let default = normalize_name(default);
                if let Some(cert) = self.select(hello, self.cache.lookup_exact(&default)) {
                    return Some(CacheHit::Defaulted(cert));
                }
            }
            return None;
        }

        if let Some(cert) = self.select(hello, self.cache.lookup_with_wildcards(&name)) {
            return Some(CacheHit::Matched(cert));
        }
        self.cache.get_by_hash(&name).map(CacheHit::Matched)
    }

    /// Pick among `candidates`. A custom selector given no candidates is
    /// offered every cached certificate.
    fn select(&self, hello: &ClientHelloInfo, candidates: Vec<Certificate>) -> Option<Certificate> {
        let candidates = match (&self.config.selector, candidates.is_empty()) {
            (None, true) => return None,
            (Some(_), true) => self.cache.all(),
            (_, false) => candidates,
        };

        let selector: &dyn CertificateSelector = match &self.config.selector {
            Some(selector) => selector.as_ref(),
            None => &DefaultSelector,
        };
        match selector.select(hello, &candidates) {
            Ok(cert) => Some(cert),
            Err(e) => {
                debug!(server_name = %hello.name(), error = %e, "Certificate selection failed");
                None
            }
        }
    }

    fn get_cert_during_handshake<'a>(
        self: &'a Arc<Self>,
        hello: &'a ClientHelloInfo,
        load_if_necessary: bool,
        obtain_if_necessary: bool,
    ) -> BoxFuture<'a, Result<Certificate, CertError>> {
        async move {
            let defaulted = match self.get_certificate_from_cache(hello) {
                Some(CacheHit::Matched(cert)) => return self.optional_maintenance(hello, cert).await,
                Some(CacheHit::Defaulted(cert)) => Some(cert),
                None => None,
            };

            let name = hello.name();
            if self.on_demand_enabled() && load_if_necessary && !name.is_empty() {
                let ctx = OperationContext::new();
                match self.load_on_demand(&ctx, &name).await {
                    Ok(loaded) => {
                        return match self.handshake_maintenance(hello, loaded.clone()).await {
                            Ok(cert) => Ok(cert),
                            Err(e) => {
                                error!(server_name = %name, error = %e, "Maintaining newly-loaded certificate");
                                Ok(loaded)
                            }
                        };
                    }
                    Err(e) if e.is_not_found() => {
                        trace!(server_name = %name, "Certificate not in storage");
                    }
                    Err(e) => {
                        warn!(server_name = %name, error = %e, "Loading certificate from storage");
                    }
                }

                if obtain_if_necessary {
                    return self.obtain_on_demand_certificate(hello, &name).await;
                }
            }

            if let Some(cert) = defaulted {
                return Ok(cert);
            }

            debug!(server_name = %name, "No certificate matching name");
            Err(CertError::NoCertificate(name))
        }
        .boxed()
    }

    /// Load `name`, or its first-label wildcard, from storage into the cache
    async fn load_on_demand(
        &self,
        ctx: &OperationContext,
        name: &str,
    ) -> Result<Certificate, CertError> {
        match self.cache_managed_certificate(ctx, name).await {
            Err(e) if e.is_not_found() => match first_label_wildcard(name) {
                Some(wildcard) => self.cache_managed_certificate(ctx, &wildcard).await,
                None => Err(e),
            },
            other => other,
        }
    }

    /// Maintain a cached managed certificate. A failure is only fatal once
    /// the certificate has expired.
    async fn optional_maintenance(
        self: &Arc<Self>,
        hello: &ClientHelloInfo,
        cert: Certificate,
    ) -> Result<Certificate, CertError> {
        if !cert.managed() {
            return Ok(cert);
        }

        match self.handshake_maintenance(hello, cert.clone()).await {
            Ok(maintained) => Ok(maintained),
            Err(e) => {
                if cert.expired(Utc::now()) {
                    return Err(e);
                }
                warn!(
                    server_name = %hello.name(),
                    error = %e,
                    "Renewing certificate failed; serving existing certificate"
                );
                Ok(cert)
            }
        }
    }

    /// Renew when due, else refresh a stale OCSP staple
    async fn handshake_maintenance(
        self: &Arc<Self>,
        hello: &ClientHelloInfo,
        cert: Certificate,
    ) -> Result<Certificate, CertError> {
        let now = Utc::now();
        if cert.needs_renewal(self.config.renewal_window_ratio, now) {
            return self.renew_dynamic_certificate(hello, cert).await;
        }

        let stale_staple = cert
            .ocsp()
            .is_some_and(|response| !response.is_fresh(cert.not_after(), now));
        if !stale_staple {
            return Ok(cert);
        }

        let ctx = OperationContext::new().with_timeout(HANDSHAKE_OCSP_TIMEOUT);
        let mut refreshed = cert.clone();
        match self.staple_ocsp(&ctx, &mut refreshed).await {
            Ok(_) => {
                if let Some(response) = refreshed.ocsp() {
                    self.cache.set_ocsp(cert.hash(), response.clone());
                }
                Ok(refreshed)
            }
            Err(e) => {
                warn!(identifiers = ?cert.names(), error = %e, "Stapling OCSP during handshake");
                Ok(cert)
            }
        }
    }

    /// Renew a certificate found due during a handshake.
    ///
    /// With time left the renewal runs in the background and `current` is
    /// served; an expired certificate blocks until renewal finishes.
    async fn renew_dynamic_certificate(
        self: &Arc<Self>,
        hello: &ClientHelloInfo,
        current: Certificate,
    ) -> Result<Certificate, CertError> {
        let name = current.names().first().cloned().ok_or(CertError::NoNames)?;
        let time_left = !current.expired(Utc::now());

        let guard = match self.cache.flights().begin(&name) {
            Flight::Leader(guard) => guard,
            Flight::Follower(waiter) => {
                if time_left {
                    debug!(identifier = %name, "Renewal already in progress; serving current certificate");
                    return Ok(current);
                }
                debug!(identifier = %name, "Waiting for in-progress renewal of expired certificate");
                match timeout(FLIGHT_WAIT_TIMEOUT, waiter.wait()).await {
                    Err(_) => {
                        return Err(CertError::Timeout(format!(
                            "timed out waiting for certificate renewal of {name}"
                        )))
                    }
                    Ok(Some(Err(shared))) => return Err(CertError::Shared(shared)),
                    Ok(_) => {}
                }
                return self.get_cert_during_handshake(hello, true, false).await;
            }
        };

        if self.on_demand_enabled() {
            if let Err(e) = self.check_if_cert_should_be_obtained(&hello.name()) {
                self.cache.remove(&current);
                return Err(fail_flight(guard, e));
            }
        }

        if time_left {
            let manager = Arc::clone(self);
            let ctx = OperationContext::new().with_timeout(BACKGROUND_RENEWAL_TIMEOUT);
            let renewing = current.clone();
            let identifier = name.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.renew_and_reload(ctx, renewing, guard).await {
                    warn!(identifier = %identifier, error = %e, "Background certificate renewal failed");
                }
            });
            return Ok(current);
        }

        let ctx = OperationContext::new().with_timeout(BLOCKING_ISSUANCE_TIMEOUT);
        Arc::clone(self).renew_and_reload(ctx, current, guard).await
    }

    async fn renew_and_reload(
        self: Arc<Self>,
        ctx: OperationContext,
        current: Certificate,
        guard: FlightGuard,
    ) -> Result<Certificate, CertError> {
        let name = guard.name().to_string();
        info!(
            identifier = %name,
            remaining_secs = current.time_remaining(Utc::now()).num_seconds(),
            "Attempting certificate renewal"
        );

        let result = match self.renew_cert(&ctx, &name, false, false).await {
            Ok(()) => self.reload_managed_certificate(&ctx, &current).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(renewed) => {
                guard.finish(Ok(()));
                Ok(renewed)
            }
            Err(e) => {
                error!(identifier = %name, error = %e, "Renewing certificate during handshake");
                Err(fail_flight(guard, e))
            }
        }
    }

    /// Obtain a certificate for `name` during a handshake, at most once at
    /// a time per name
    async fn obtain_on_demand_certificate(
        self: &Arc<Self>,
        hello: &ClientHelloInfo,
        name: &str,
    ) -> Result<Certificate, CertError> {
        let guard = match self.cache.flights().begin(name) {
            Flight::Leader(guard) => guard,
            Flight::Follower(waiter) => {
                debug!(server_name = %name, "Obtain already in progress; waiting");
                let outcome: Option<FlightOutcome> =
                    match timeout(FLIGHT_WAIT_TIMEOUT, waiter.wait()).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            return Err(CertError::Timeout(format!(
                                "timed out waiting to obtain certificate for {name}"
                            )))
                        }
                    };
                if let Some(Err(shared)) = outcome {
                    return Err(CertError::Shared(shared));
                }
                return self.get_cert_during_handshake(hello, true, false).await;
            }
        };

        if let Err(e) = self.check_if_cert_should_be_obtained(name) {
            return Err(fail_flight(guard, e));
        }

        info!(server_name = %name, "Obtaining new certificate");
        let ctx = OperationContext::new().with_timeout(BLOCKING_ISSUANCE_TIMEOUT);
        if let Err(e) = self.obtain_cert(&ctx, name, false).await {
            return Err(fail_flight(guard, e));
        }
        guard.finish(Ok(()));

        self.get_cert_during_handshake(hello, true, false).await
    }
}

/// Publish `err` to everyone waiting on `guard` and return it shared
fn fail_flight(guard: FlightGuard, err: CertError) -> CertError {
    let shared = Arc::new(err);
    guard.finish(Err(Arc::clone(&shared)));
    CertError::Shared(shared)
}

/// `a.example.com` -> `*.example.com`
fn first_label_wildcard(name: &str) -> Option<String> {
    name.split_once('.')
        .filter(|(_, rest)| !rest.is_empty())
        .map(|(_, rest)| format!("*.{rest}"))
}
