//! rustls integration.
//!
//! rustls resolves certificates synchronously, so [`CertResolver`] only
//! consults the cache. A miss with on-demand issuance enabled starts the
//! full asynchronous resolution in the background; the handshake that
//! triggered it fails and a retry finds the certificate cached.

use std::sync::Arc;

use chrono::Utc;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, warn};

use crate::handshake::CacheHit;
use crate::manager::CertManager;
use crate::selection::ClientHelloInfo;

/// Serves certificates from a [`CertManager`] to a rustls `ServerConfig`
pub struct CertResolver {
    manager: Arc<CertManager>,
}

impl CertResolver {
    pub fn new(manager: Arc<CertManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<CertManager> {
        &self.manager
    }

    /// Resolve from what rustls exposes of the client hello.
    ///
    /// The [`ResolvesServerCert`] impl has no connection address, so
    /// lookup by local IP for SNI-less hellos needs a caller that builds
    /// the hello with [`ClientHelloInfo::with_local_addr`] and calls this
    /// directly.
    pub fn resolve_hello(&self, hello: ClientHelloInfo) -> Option<Arc<CertifiedKey>> {
        let on_demand = self.manager.on_demand_enabled();
        let cert = match self.manager.get_certificate_from_cache(&hello) {
            Some(CacheHit::Matched(cert)) => cert,
            Some(CacheHit::Defaulted(cert)) => {
                if on_demand {
                    self.spawn_resolution(hello.clone());
                }
                cert
            }
            None => {
                if on_demand {
                    self.spawn_resolution(hello);
                }
                return None;
            }
        };

        if !cert.managed() {
            return cert.certified_key().cloned();
        }

        let now = Utc::now();
        let stale_staple = cert
            .ocsp()
            .is_some_and(|response| !response.is_fresh(cert.not_after(), now));
        if stale_staple || cert.needs_renewal(self.manager.config().renewal_window_ratio, now) {
            self.spawn_resolution(hello);
        }
        if cert.expired(now) {
            debug!(identifiers = ?cert.names(), "Withholding expired certificate until renewed");
            return None;
        }
        cert.certified_key().cloned()
    }

    fn spawn_resolution(&self, hello: ClientHelloInfo) {
        // Nothing to issue for without a server name
        if hello.name().is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(server_name = %hello.name(), "No async runtime; cannot resolve certificate in background");
            return;
        };
        let manager = Arc::clone(&self.manager);
        handle.spawn(async move {
            if let Err(e) = manager.get_certificate(&hello).await {
                debug!(server_name = %hello.name(), error = %e, "Background certificate resolution failed");
            }
        });
    }
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("cached", &self.manager.cache().len())
            .finish()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let mut hello = ClientHelloInfo::default()
            .with_signature_schemes(client_hello.signature_schemes().to_vec());
        hello.server_name = client_hello.server_name().map(str::to_string);
        self.resolve_hello(hello)
    }
}
