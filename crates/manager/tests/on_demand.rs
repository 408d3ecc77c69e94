//! On-demand issuance through the public API

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certward::{
    CacheOptions, CertCache, CertManager, CertificateRequest, ClientHelloInfo, IssueError,
    IssuedCertificate, Issuer, ManagerConfig, MemoryStorage, OnDemandPolicy,
};
use certward_common::OperationContext;
use rcgen::{CertificateParams, KeyPair};

/// Self-signs whatever it is asked for, after an optional delay
struct SelfSigningIssuer {
    calls: AtomicU32,
    delay: Duration,
}

impl SelfSigningIssuer {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Issuer for SelfSigningIssuer {
    async fn issue(
        &self,
        _ctx: &OperationContext,
        request: &CertificateRequest,
    ) -> Result<IssuedCertificate, IssueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        let key = KeyPair::from_pem(&request.private_key_pem)
            .map_err(|e| IssueError::Rejected(e.to_string()))?;
        let params = CertificateParams::new(request.names.clone())
            .map_err(|e| IssueError::Rejected(e.to_string()))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| IssueError::Rejected(e.to_string()))?;
        Ok(IssuedCertificate {
            certificate_pem: cert.pem(),
            metadata: None,
        })
    }

    fn issuer_key(&self) -> String {
        "self-signed".to_string()
    }
}

fn on_demand_manager(capacity: usize, issuer: Arc<SelfSigningIssuer>) -> Arc<CertManager> {
    let cache = Arc::new(CertCache::new(CacheOptions {
        capacity,
        ..CacheOptions::default()
    }));
    let config = ManagerConfig::new(Arc::new(MemoryStorage::new()))
        .with_issuer(issuer)
        .with_on_demand(OnDemandPolicy::new());
    CertManager::new(cache, config)
}

#[tokio::test]
async fn test_issue_cache_and_evict() {
    let issuer = SelfSigningIssuer::new(Duration::ZERO);
    let manager = on_demand_manager(2, Arc::clone(&issuer));

    let a = manager
        .get_certificate(&ClientHelloInfo::new("a.example.com"))
        .await
        .unwrap();
    assert_eq!(a.names()[0], "a.example.com");
    assert_eq!(issuer.calls(), 1);
    assert_eq!(manager.cache().len(), 1);

    let again = manager
        .get_certificate(&ClientHelloInfo::new("a.example.com"))
        .await
        .unwrap();
    assert_eq!(again.hash(), a.hash());
    assert_eq!(issuer.calls(), 1);

    let b = manager
        .get_certificate(&ClientHelloInfo::new("b.example.com"))
        .await
        .unwrap();
    assert_eq!(manager.cache().len(), 2);

    let c = manager
        .get_certificate(&ClientHelloInfo::new("c.example.com"))
        .await
        .unwrap();
    assert_eq!(issuer.calls(), 3);
    assert_eq!(manager.cache().len(), 2);
    assert!(manager.cache().contains(c.hash()));
    assert!(manager.cache().contains(a.hash()) ^ manager.cache().contains(b.hash()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_handshakes_share_one_issuance() {
    let issuer = SelfSigningIssuer::new(Duration::from_millis(100));
    let manager = on_demand_manager(0, Arc::clone(&issuer));

    let handshakes: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .get_certificate(&ClientHelloInfo::new("busy.example.com"))
                    .await
            })
        })
        .collect();

    let mut hashes = Vec::new();
    for handshake in handshakes {
        let cert = handshake.await.unwrap().unwrap();
        hashes.push(cert.hash().to_string());
    }

    assert_eq!(issuer.calls(), 1);
    hashes.dedup();
    assert_eq!(hashes.len(), 1);
    assert!(manager.cache().flights().is_empty());
}

#[tokio::test]
async fn test_allowlist_gates_issuance() {
    let issuer = SelfSigningIssuer::new(Duration::ZERO);
    let cache = Arc::new(CertCache::new(CacheOptions::default()));
    let config = ManagerConfig::new(Arc::new(MemoryStorage::new()))
        .with_issuer(issuer.clone())
        .with_on_demand(OnDemandPolicy::new().allow(["allowed.example.com"]));
    let manager = CertManager::new(cache, config);

    let err = manager
        .get_certificate(&ClientHelloInfo::new("denied.example.com"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("is not managed"));
    assert_eq!(issuer.calls(), 0);

    manager
        .get_certificate(&ClientHelloInfo::new("allowed.example.com"))
        .await
        .unwrap();
    assert_eq!(issuer.calls(), 1);
}
