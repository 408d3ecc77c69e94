//! Certificates held in the cache.
//!
//! A [`Certificate`] is a parsed chain plus signing key, annotated with the
//! subject names it covers, the content hash that identifies it in the
//! cache, and management metadata. Clones are cheap; the chain, key, and
//! OCSP response are shared.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};
use tracing::trace;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::error::CertError;
use crate::ocsp::{OcspResponse, OcspStatus};

const OID_RSA: &str = "1.2.840.113549.1.1.1";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_ED25519: &str = "1.3.101.112";
const OID_CURVE_P256: &str = "1.2.840.10045.3.1.7";
const OID_CURVE_P384: &str = "1.3.132.0.34";
const OID_CURVE_P521: &str = "1.3.132.0.35";

/// Public key algorithm of a leaf certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    Rsa,
    EcdsaP256,
    EcdsaP384,
    EcdsaP521,
    Ed25519,
    /// Not recognised; treated as acceptable to every client
    Unknown,
}

/// Metadata parsed from a certificate chain's leaf
#[derive(Debug, Clone)]
pub struct ChainInfo {
    pub names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub key_algorithm: KeyAlgorithm,
    pub hash: String,
}

impl ChainInfo {
    /// Parse a PEM chain without requiring the private key
    pub fn from_pem(chain_pem: &[u8]) -> Result<Self, CertError> {
        let chain = read_chain(chain_pem)?;
        Self::from_der_chain(&chain)
    }

    fn from_der_chain(chain: &[CertificateDer<'static>]) -> Result<Self, CertError> {
        let leaf = chain
            .first()
            .ok_or_else(|| CertError::InvalidCertificate("no certificates found in PEM".into()))?;
        let (_, cert) = X509Certificate::from_der(leaf.as_ref())
            .map_err(|e| CertError::InvalidCertificate(format!("parsing leaf certificate: {e}")))?;

        let mut names = Vec::new();
        for cn in cert.subject().iter_common_name() {
            if let Ok(cn) = cn.as_str() {
                names.push(cn.to_string());
            }
        }
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for general_name in &san.value.general_names {
                match general_name {
                    GeneralName::DNSName(dns) => names.push((*dns).to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            names.push(ip.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        let validity = cert.validity();
        let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
            .ok_or_else(|| CertError::InvalidCertificate("notBefore out of range".into()))?;
        let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
            .ok_or_else(|| CertError::InvalidCertificate("notAfter out of range".into()))?;

        let spki = cert.public_key();
        let key_algorithm = match spki.algorithm.algorithm.to_id_string().as_str() {
            OID_RSA => KeyAlgorithm::Rsa,
            OID_ED25519 => KeyAlgorithm::Ed25519,
            OID_EC_PUBLIC_KEY => {
                let curve = spki
                    .algorithm
                    .parameters
                    .as_ref()
                    .and_then(|params| params.as_oid().ok())
                    .map(|oid| oid.to_id_string());
                match curve.as_deref() {
                    Some(OID_CURVE_P256) => KeyAlgorithm::EcdsaP256,
                    Some(OID_CURVE_P384) => KeyAlgorithm::EcdsaP384,
                    Some(OID_CURVE_P521) => KeyAlgorithm::EcdsaP521,
                    _ => KeyAlgorithm::Unknown,
                }
            }
            _ => KeyAlgorithm::Unknown,
        };

        Ok(Self {
            names: normalize_names(names),
            not_before,
            not_after,
            key_algorithm,
            hash: hash_chain(chain),
        })
    }
}

/// A TLS certificate as held in the cache
#[derive(Clone)]
pub struct Certificate {
    names: Vec<String>,
    hash: String,
    chain_pem: Arc<[u8]>,
    certified_key: Option<Arc<CertifiedKey>>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    key_algorithm: KeyAlgorithm,
    ocsp: Option<Arc<OcspResponse>>,
    managed: bool,
    issuer_key: Option<String>,
    tags: Vec<String>,
}

impl Certificate {
    /// Parse a PEM chain and its PEM private key.
    ///
    /// Names come from the leaf's CN and DNS/IP SANs.
    pub fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self, CertError> {
        let chain = read_chain(chain_pem)?;
        let info = ChainInfo::from_der_chain(&chain)?;

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| CertError::InvalidCertificate(format!("reading private key PEM: {e}")))?
            .ok_or_else(|| CertError::InvalidCertificate("no private key found in PEM".into()))?;
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
            .map_err(|e| CertError::InvalidCertificate(format!("unsupported private key: {e}")))?;

        trace!(
            identifiers = ?info.names,
            hash = %info.hash,
            not_after = %info.not_after,
            "Parsed certificate"
        );

        Ok(Self {
            names: info.names,
            hash: info.hash,
            chain_pem: Arc::from(chain_pem),
            certified_key: Some(Arc::new(CertifiedKey::new(chain, signing_key))),
            not_before: info.not_before,
            not_after: info.not_after,
            key_algorithm: info.key_algorithm,
            ocsp: None,
            managed: false,
            issuer_key: None,
            tags: Vec::new(),
        })
    }

    /// Build a certificate from already-known metadata.
    ///
    /// `content` is hashed to produce the cache identity. The result carries
    /// no signing key, so it can be cached and matched but not served over
    /// rustls.
    pub fn from_parts(
        names: impl IntoIterator<Item = impl Into<String>>,
        content: &[u8],
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Self {
        Self {
            names: normalize_names(names.into_iter().map(Into::into)),
            hash: hex::encode(Sha256::digest(content)),
            chain_pem: Arc::from(content),
            certified_key: None,
            not_before,
            not_after,
            key_algorithm: KeyAlgorithm::Unknown,
            ocsp: None,
            managed: false,
            issuer_key: None,
            tags: Vec::new(),
        }
    }

    pub fn with_managed(mut self, managed: bool) -> Self {
        self.managed = managed;
        self
    }

    pub fn with_issuer_key(mut self, issuer_key: impl Into<String>) -> Self {
        self.issuer_key = Some(issuer_key.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_key_algorithm(mut self, key_algorithm: KeyAlgorithm) -> Self {
        self.key_algorithm = key_algorithm;
        self
    }

    pub fn with_ocsp(mut self, response: OcspResponse) -> Self {
        self.set_ocsp(response);
        self
    }

    /// Attach an OCSP response.
    ///
    /// The raw bytes are stapled to the served key only when the status is
    /// good; the parsed response is kept either way so revocation can be
    /// acted on.
    pub(crate) fn set_ocsp(&mut self, response: OcspResponse) {
        if let Some(key) = &self.certified_key {
            let mut stapled = CertifiedKey::clone(key);
            stapled.ocsp = match response.status {
                OcspStatus::Good => Some(response.raw.clone()),
                _ => None,
            };
            self.certified_key = Some(Arc::new(stapled));
        }
        self.ocsp = Some(Arc::new(response));
    }

    /// Subject names, lower-cased and deduplicated
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Hex SHA-256 of the chain; the cache identity
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn chain_pem(&self) -> &[u8] {
        &self.chain_pem
    }

    /// Key material for rustls, if this certificate carries a private key
    pub fn certified_key(&self) -> Option<&Arc<CertifiedKey>> {
        self.certified_key.as_ref()
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn key_algorithm(&self) -> KeyAlgorithm {
        self.key_algorithm
    }

    pub fn ocsp(&self) -> Option<&OcspResponse> {
        self.ocsp.as_deref()
    }

    /// True if this process is responsible for renewing the certificate
    pub fn managed(&self) -> bool {
        self.managed
    }

    pub fn issuer_key(&self) -> Option<&str> {
        self.issuer_key.as_deref()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now > self.not_after
    }

    /// True if `now` lies within [not_before, not_after]
    pub fn in_validity(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before && now <= self.not_after
    }

    /// Time until expiry; negative once expired
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Duration {
        self.not_after - now
    }

    /// True once the trailing `ratio` of the lifetime has been entered
    pub fn needs_renewal(&self, ratio: f64, now: DateTime<Utc>) -> bool {
        in_renewal_window(self.not_before, self.not_after, ratio, now)
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("names", &self.names)
            .field("hash", &self.hash)
            .field("not_after", &self.not_after)
            .field("key_algorithm", &self.key_algorithm)
            .field("managed", &self.managed)
            .field("issuer_key", &self.issuer_key)
            .field("ocsp", &self.ocsp.as_ref().map(|r| r.status))
            .finish()
    }
}

/// True if `now` is past the start of the renewal window: the trailing
/// `ratio` of the lifetime, measured back from `not_after`.
pub fn in_renewal_window(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    ratio: f64,
    now: DateTime<Utc>,
) -> bool {
    let lifetime = (not_after - not_before).num_milliseconds().max(0);
    let window = Duration::milliseconds((lifetime as f64 * ratio) as i64);
    now > not_after - window
}

/// Lower-case, trim, and deduplicate names, keeping first occurrence order
pub fn normalize_names(names: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in names {
        let name = normalize_name(&name);
        if !name.is_empty() && !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

/// Canonical form of a server name
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn read_chain(chain_pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let chain = rustls_pemfile::certs(&mut &chain_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::InvalidCertificate(format!("reading certificate PEM: {e}")))?;
    if chain.is_empty() {
        return Err(CertError::InvalidCertificate(
            "no certificates found in PEM".into(),
        ));
    }
    Ok(chain)
}

fn hash_chain(chain: &[CertificateDer<'_>]) -> String {
    let mut hasher = Sha256::new();
    for cert in chain {
        hasher.update(cert.as_ref());
    }
    hex::encode(hasher.finalize())
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(bytes).ok().map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}
