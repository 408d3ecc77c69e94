//! Choosing among several certificates for one handshake.

use std::net::SocketAddr;

use chrono::Utc;
use rustls::SignatureScheme;

use crate::certificate::{normalize_name, Certificate, KeyAlgorithm};
use crate::error::CertError;

/// What the resolver knows about an incoming handshake
#[derive(Debug, Clone, Default)]
pub struct ClientHelloInfo {
    /// SNI as sent by the client
    pub server_name: Option<String>,
    /// Signature schemes the client offered; empty means unknown, in which
    /// case every certificate is considered supported
    pub signature_schemes: Vec<SignatureScheme>,
    /// Local address the connection arrived on
    pub local_addr: Option<SocketAddr>,
}

impl ClientHelloInfo {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: Some(server_name.into()),
            ..Default::default()
        }
    }

    pub fn with_signature_schemes(mut self, schemes: Vec<SignatureScheme>) -> Self {
        self.signature_schemes = schemes;
        self
    }

    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// Normalised SNI, empty if none was sent
    pub fn normalized_server_name(&self) -> String {
        self.server_name
            .as_deref()
            .map(normalize_name)
            .unwrap_or_default()
    }

    /// Local IP of the connection without port or IPv6 scope
    pub fn local_ip(&self) -> Option<String> {
        self.local_addr.map(|addr| addr.ip().to_string())
    }

    /// Name used to key on-demand work: the SNI, else the local IP
    pub fn name(&self) -> String {
        let name = self.normalized_server_name();
        if name.is_empty() {
            self.local_ip().unwrap_or_default()
        } else {
            name
        }
    }

    /// True if the client can verify a signature from `algorithm`
    pub fn supports(&self, algorithm: KeyAlgorithm) -> bool {
        if self.signature_schemes.is_empty() {
            return true;
        }
        let accepted: &[SignatureScheme] = match algorithm {
            KeyAlgorithm::Rsa => &[
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
            ],
            KeyAlgorithm::EcdsaP256 => &[SignatureScheme::ECDSA_NISTP256_SHA256],
            KeyAlgorithm::EcdsaP384 => &[SignatureScheme::ECDSA_NISTP384_SHA384],
            KeyAlgorithm::EcdsaP521 => &[SignatureScheme::ECDSA_NISTP521_SHA512],
            KeyAlgorithm::Ed25519 => &[SignatureScheme::ED25519],
            KeyAlgorithm::Unknown => return true,
        };
        self.signature_schemes
            .iter()
            .any(|scheme| accepted.contains(scheme))
    }
}

/// Picks the certificate to serve from a set of candidates
pub trait CertificateSelector: Send + Sync {
    fn select(
        &self,
        hello: &ClientHelloInfo,
        candidates: &[Certificate],
    ) -> Result<Certificate, CertError>;
}

/// Prefers a client-supported certificate inside its validity window, then
/// any client-supported certificate, then the first candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSelector;

impl CertificateSelector for DefaultSelector {
    fn select(
        &self,
        hello: &ClientHelloInfo,
        candidates: &[Certificate],
    ) -> Result<Certificate, CertError> {
        let first = candidates
            .first()
            .ok_or_else(|| CertError::NoCertificate(hello.name()))?;

        let now = Utc::now();
        let mut fallback: Option<&Certificate> = None;
        for candidate in candidates {
            if !hello.supports(candidate.key_algorithm()) {
                continue;
            }
            if candidate.in_validity(now) {
                return Ok(candidate.clone());
            }
            if fallback.is_none() {
                fallback = Some(candidate);
            }
        }
        Ok(fallback.unwrap_or(first).clone())
    }
}
