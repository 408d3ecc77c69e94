//! OCSP stapling.
//!
//! Fetching and parsing OCSP responses is delegated to an [`OcspStapler`].
//! This module decides when a staple is stale, reuses staples persisted by
//! other processes, and attaches responses to certificates.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use certward_common::OperationContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use crate::certificate::Certificate;
use crate::error::OcspError;
use crate::storage::{Storage, StorageKeys};

/// Revocation status reported by a responder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcspStatus {
    Good,
    Revoked,
    Unknown,
}

/// A parsed OCSP response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcspResponse {
    pub status: OcspStatus,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    /// DER bytes as received, stapled verbatim
    #[serde(serialize_with = "serialize_raw", deserialize_with = "deserialize_raw")]
    pub raw: Vec<u8>,
}

impl OcspResponse {
    pub fn new(
        status: OcspStatus,
        this_update: DateTime<Utc>,
        next_update: Option<DateTime<Utc>>,
        raw: Vec<u8>,
    ) -> Self {
        Self {
            status,
            this_update,
            next_update,
            revoked_at: None,
            raw,
        }
    }

    /// When the response should be refreshed: halfway between this_update
    /// and next_update, with next_update clamped to the certificate's expiry
    pub fn refresh_at(&self, cert_not_after: DateTime<Utc>) -> DateTime<Utc> {
        let end = match self.next_update {
            Some(next) if next < cert_not_after => next,
            _ => cert_not_after,
        };
        self.this_update + (end - self.this_update) / 2
    }

    /// True until the refresh point
    pub fn is_fresh(&self, cert_not_after: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now < self.refresh_at(cert_not_after)
    }
}

fn serialize_raw<S: Serializer>(raw: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(raw))
}

fn deserialize_raw<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

/// Fetches OCSP responses for certificates
#[async_trait]
pub trait OcspStapler: Send + Sync {
    /// Ask the certificate's responder for its current status.
    ///
    /// `pem` is the chain as stored, when the caller already has it.
    async fn fetch(
        &self,
        ctx: &OperationContext,
        cert: &Certificate,
        pem: Option<&[u8]>,
    ) -> Result<OcspResponse, OcspError>;
}

/// Attach a fresh OCSP response to `cert`.
///
/// A still-fresh staple persisted in storage is preferred; otherwise the
/// stapler is asked and a good response is persisted for other processes.
/// A corrupt stored staple is deleted.
pub async fn staple_ocsp(
    ctx: &OperationContext,
    storage: &dyn Storage,
    stapler: &dyn OcspStapler,
    cert: &mut Certificate,
    pem: Option<&[u8]>,
) -> Result<(), OcspError> {
    let key = StorageKeys::ocsp_staple(cert.names(), cert.hash());
    let now = Utc::now();

    let mut response = None;
    match storage.load(&key).await {
        Ok(raw) => match serde_json::from_slice::<OcspResponse>(&raw) {
            Ok(stored) if stored.is_fresh(cert.not_after(), now) => {
                debug!(identifiers = ?cert.names(), "Using OCSP staple from storage");
                response = Some(stored);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Deleting corrupt OCSP staple");
                if let Err(e) = storage.delete(&key).await {
                    warn!(key = %key, error = %e, "Failed to delete corrupt OCSP staple");
                }
            }
        },
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    let fetched = response.is_none();
    let response = match response {
        Some(response) => response,
        None => stapler.fetch(ctx, cert, pem).await?,
    };

    if let Some(next_update) = response.next_update {
        if next_update > cert.not_after() {
            return Err(OcspError::Invalid(format!(
                "response for {:?} valid after certificate expiration ({})",
                cert.names(),
                cert.not_after()
            )));
        }
    }

    if fetched && response.status == OcspStatus::Good {
        let encoded =
            serde_json::to_vec(&response).map_err(|e| OcspError::Invalid(e.to_string()))?;
        storage.store(&key, &encoded).await?;
    }

    debug!(
        identifiers = ?cert.names(),
        status = ?response.status,
        next_update = ?response.next_update,
        "Attached OCSP response"
    );
    cert.set_ocsp(response);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use chrono::Duration;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedStapler {
        status: OcspStatus,
        calls: AtomicU32,
    }

    #[async_trait]
    impl OcspStapler for FixedStapler {
        async fn fetch(
            &self,
            _ctx: &OperationContext,
            _cert: &Certificate,
            _pem: Option<&[u8]>,
        ) -> Result<OcspResponse, OcspError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            Ok(OcspResponse::new(self.status, now, Some(now + Duration::days(7)), vec![0x30, 0x03]))
        }
    }

    fn cert() -> Certificate {
        let now = Utc::now();
        Certificate::from_parts(["a.example.com"], b"chain", now - Duration::days(1), now + Duration::days(60))
    }

    #[test]
    fn test_refresh_at_midpoint() {
        let this_update = Utc::now();
        let response = OcspResponse::new(
            OcspStatus::Good,
            this_update,
            Some(this_update + Duration::days(4)),
            vec![],
        );
        let far_expiry = this_update + Duration::days(90);
        assert_eq!(response.refresh_at(far_expiry), this_update + Duration::days(2));
        assert!(response.is_fresh(far_expiry, this_update + Duration::days(1)));
        assert!(!response.is_fresh(far_expiry, this_update + Duration::days(3)));

        // Clamped to the certificate's expiry
        assert_eq!(
            response.refresh_at(this_update + Duration::days(2)),
            this_update + Duration::days(1)
        );
    }

    #[test]
    fn test_raw_is_base64_in_json() {
        let response = OcspResponse::new(OcspStatus::Revoked, Utc::now(), None, vec![1, 2, 3]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["raw"], "AQID");
        assert_eq!(json["status"], "revoked");
        let back: OcspResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back, response);
    }

    #[tokio::test]
    async fn test_staple_is_fetched_then_reused_from_storage() {
        let storage = MemoryStorage::new();
        let stapler = FixedStapler {
            status: OcspStatus::Good,
            calls: AtomicU32::new(0),
        };
        let ctx = OperationContext::new();

        let mut first = cert();
        staple_ocsp(&ctx, &storage, &stapler, &mut first, None).await.unwrap();
        assert_eq!(first.ocsp().unwrap().status, OcspStatus::Good);
        assert_eq!(stapler.calls.load(Ordering::SeqCst), 1);

        let mut second = cert();
        staple_ocsp(&ctx, &storage, &stapler, &mut second, None).await.unwrap();
        assert!(second.ocsp().is_some());
        assert_eq!(stapler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_revoked_is_attached_but_not_persisted() {
        let storage = MemoryStorage::new();
        let stapler = FixedStapler {
            status: OcspStatus::Revoked,
            calls: AtomicU32::new(0),
        };
        let mut cert = cert();
        staple_ocsp(&OperationContext::new(), &storage, &stapler, &mut cert, None)
            .await
            .unwrap();
        assert_eq!(cert.ocsp().unwrap().status, OcspStatus::Revoked);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_stored_staple_is_replaced() {
        let storage = MemoryStorage::new();
        let mut cert = cert();
        let key = StorageKeys::ocsp_staple(cert.names(), cert.hash());
        storage.store(&key, b"{not json").await.unwrap();

        let stapler = FixedStapler {
            status: OcspStatus::Good,
            calls: AtomicU32::new(0),
        };
        staple_ocsp(&OperationContext::new(), &storage, &stapler, &mut cert, None)
            .await
            .unwrap();
        assert_eq!(stapler.calls.load(Ordering::SeqCst), 1);
        let stored: OcspResponse = serde_json::from_slice(&storage.load(&key).await.unwrap()).unwrap();
        assert_eq!(stored.status, OcspStatus::Good);
    }
}
