//! Error types for certificate management.

use std::sync::Arc;

use certward_common::{ContextError, RetryDecision, RetryError};
use thiserror::Error;

/// Errors returned by [`Storage`](crate::storage::Storage) backends
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timed out waiting for lock '{key}'")]
    LockTimeout { key: String },

    #[error("Cancelled while waiting for lock '{key}'")]
    LockCancelled { key: String },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// True if the key simply does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub(crate) fn from_context(key: &str, reason: ContextError) -> Self {
        match reason {
            ContextError::DeadlineExceeded => StorageError::LockTimeout {
                key: key.to_string(),
            },
            ContextError::Cancelled => StorageError::LockCancelled {
                key: key.to_string(),
            },
        }
    }
}

/// Errors returned by [`Issuer`](crate::issuer::Issuer) implementations
#[derive(Error, Debug)]
pub enum IssueError {
    /// Network or upstream failure that may succeed later
    #[error("{0}")]
    Transient(String),

    /// Definitive rejection; retrying cannot help
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Cancelled(#[from] ContextError),
}

/// Errors returned by OCSP staplers. Never fatal.
#[derive(Error, Debug)]
pub enum OcspError {
    #[error("certificate has no OCSP responder")]
    NoResponder,

    #[error("OCSP request failed: {0}")]
    Fetch(String),

    #[error("invalid OCSP response: {0}")]
    Invalid(String),

    #[error("OCSP staple storage: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Cancelled(#[from] ContextError),
}

/// Errors surfaced by the certificate manager and handshake resolver
#[derive(Error, Debug)]
pub enum CertError {
    #[error("no certificate available for '{0}'")]
    NoCertificate(String),

    #[error("certificate for '{name}' may not be obtained: {reason}")]
    PolicyDenied { name: String, reason: String },

    #[error("{op} certificate for '{name}' with issuer '{issuer}': {source}")]
    Issuance {
        op: &'static str,
        name: String,
        issuer: String,
        #[source]
        source: IssueError,
    },

    #[error("certificate has no subject names")]
    NoNames,

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("no issuers configured; impossible to obtain or check for existing certificate in storage")]
    NoIssuers,

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Cancelled(#[from] ContextError),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// Wraps an error that must not be retried
    #[error("{0}")]
    NoRetry(Box<CertError>),

    /// An error produced once and handed to every caller waiting on the
    /// same operation
    #[error(transparent)]
    Shared(Arc<CertError>),
}

impl CertError {
    /// Mark `err` as terminal for the Retry Coordinator
    pub fn no_retry(err: CertError) -> Self {
        match err {
            CertError::NoRetry(_) => err,
            other => CertError::NoRetry(Box::new(other)),
        }
    }

    /// True if the underlying cause is a missing storage key
    pub fn is_not_found(&self) -> bool {
        match self {
            CertError::Storage(e) => e.is_not_found(),
            CertError::NoRetry(inner) => inner.is_not_found(),
            CertError::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }
}

impl RetryDecision for CertError {
    fn is_terminal(&self) -> bool {
        match self {
            CertError::PolicyDenied { .. }
            | CertError::NoNames
            | CertError::InvalidCertificate(_)
            | CertError::NoIssuers
            | CertError::Cancelled(_)
            | CertError::NoRetry(_) => true,
            CertError::Issuance { source, .. } => {
                matches!(source, IssueError::Rejected(_) | IssueError::Cancelled(_))
            }
            CertError::Shared(inner) => inner.is_terminal(),
            CertError::NoCertificate(_) | CertError::Timeout(_) | CertError::Storage(_) => false,
        }
    }
}

impl From<RetryError<CertError>> for CertError {
    fn from(err: RetryError<CertError>) -> Self {
        match err {
            RetryError::Terminal(e) => e,
            RetryError::Exhausted { last, .. } => last,
            RetryError::Cancelled { reason, last, .. } => match last {
                Some(last) => last,
                None => CertError::Cancelled(reason),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_certificate_message() {
        let err = CertError::NoCertificate("a.example.com".to_string());
        assert_eq!(err.to_string(), "no certificate available for 'a.example.com'");
    }

    #[test]
    fn test_issuance_message_names_subject_and_issuer() {
        let err = CertError::Issuance {
            op: "obtaining",
            name: "a.example.com".to_string(),
            issuer: "acme-v02.example.net".to_string(),
            source: IssueError::Transient("connection reset".to_string()),
        };
        let message = err.to_string();
        assert!(message.contains("a.example.com"));
        assert!(message.contains("acme-v02.example.net"));
        assert!(message.contains("connection reset"));
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_terminal_classification() {
        let rejected = CertError::Issuance {
            op: "obtaining",
            name: "a.example.com".to_string(),
            issuer: "test".to_string(),
            source: IssueError::Rejected("unauthorized".to_string()),
        };
        assert!(rejected.is_terminal());
        assert!(CertError::no_retry(CertError::Timeout("slow".into())).is_terminal());
        assert!(!CertError::Storage(StorageError::Backend("down".into())).is_terminal());
        assert!(CertError::Shared(Arc::new(CertError::NoIssuers)).is_terminal());
    }

    #[test]
    fn test_no_retry_is_not_nested() {
        let err = CertError::no_retry(CertError::no_retry(CertError::NoNames));
        match err {
            CertError::NoRetry(inner) => assert!(matches!(*inner, CertError::NoNames)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_not_found_through_wrappers() {
        let err = CertError::Shared(Arc::new(CertError::Storage(StorageError::NotFound(
            "certificates/x".into(),
        ))));
        assert!(err.is_not_found());

        let io = StorageError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(io.is_not_found());
    }

    #[test]
    fn test_from_retry_error() {
        let err: CertError = RetryError::<CertError>::Cancelled {
            reason: ContextError::DeadlineExceeded,
            attempts: 0,
            last: None,
        }
        .into();
        assert!(matches!(err, CertError::Cancelled(ContextError::DeadlineExceeded)));

        let err: CertError = RetryError::Exhausted {
            attempts: 3,
            elapsed: std::time::Duration::from_secs(1),
            last: CertError::NoCertificate("x".into()),
        }
        .into();
        assert!(matches!(err, CertError::NoCertificate(_)));
    }
}
