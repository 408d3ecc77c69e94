//! Configuration for Certward
//!
//! The configuration is a plain serde tree with defaults for every field,
//! loaded from KDL:
//!
//! ```kdl
//! cache {
//!     capacity 500
//!     renew-check-interval-secs 600
//! }
//! renewal-window-ratio 0.3333
//! default-server-name "example.com"
//! on-demand {
//!     allow "a.example.com" "b.example.com"
//! }
//! storage {
//!     path "/var/lib/certward"
//! }
//! rate-limit {
//!     max-events 10
//!     window-secs 10
//! }
//! ```
//!
//! Runtime-only policy (issuers, decision callbacks, OCSP staplers) is not
//! configured here; the manager crate attaches it programmatically.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub mod kdl;
pub mod validate;

pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

// ============================================================================
// Defaults
// ============================================================================

/// Default renewal check interval (10 minutes)
pub fn default_renew_check_interval() -> u64 {
    600
}

/// Default OCSP check interval (1 hour)
pub fn default_ocsp_check_interval() -> u64 {
    3600
}

/// Default ceiling on job pool workers
pub fn default_max_workers() -> usize {
    1000
}

/// Default fraction of the lifetime, measured back from expiry, in which
/// renewal is attempted
pub fn default_renewal_window_ratio() -> f64 {
    1.0 / 3.0
}

pub fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/certward")
}

/// Default age after which another process's lock is considered abandoned
pub fn default_lock_stale_secs() -> u64 {
    7200
}

pub fn default_lock_poll_interval_ms() -> u64 {
    1000
}

pub fn default_rate_limit_events() -> usize {
    10
}

pub fn default_rate_limit_window() -> u64 {
    10
}

/// Default total retry budget (30 days)
pub fn default_retry_max_duration() -> u64 {
    30 * 24 * 3600
}

// ============================================================================
// Configuration tree
// ============================================================================

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub cache: CacheConfig,

    /// Fraction of a certificate's lifetime, measured back from expiry,
    /// during which it should be renewed
    pub renewal_window_ratio: f64,

    /// Name to use when a handshake carries no SNI and no certificate
    /// matches the local address
    pub default_server_name: Option<String>,

    /// Present when certificates may be obtained during handshakes
    pub on_demand: Option<OnDemandConfig>,

    pub storage: StorageConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub ocsp: OcspConfig,

    /// Request the OCSP Must-Staple extension on new certificates
    pub must_staple: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            renewal_window_ratio: default_renewal_window_ratio(),
            default_server_name: None,
            on_demand: None,
            storage: StorageConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            ocsp: OcspConfig::default(),
            must_staple: false,
        }
    }
}

/// Certificate cache and maintenance scheduler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Maximum number of cached certificates (0 = unlimited)
    pub capacity: usize,
    pub renew_check_interval_secs: u64,
    pub ocsp_check_interval_secs: u64,
    pub max_workers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            renew_check_interval_secs: default_renew_check_interval(),
            ocsp_check_interval_secs: default_ocsp_check_interval(),
            max_workers: default_max_workers(),
        }
    }
}

/// On-demand issuance policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OnDemandConfig {
    /// Names that may be obtained during a handshake. Empty means the
    /// decision is left to a runtime callback.
    pub allow: Vec<String>,
}

/// File storage settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StorageConfig {
    pub path: PathBuf,
    pub lock_stale_secs: u64,
    pub lock_poll_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            lock_stale_secs: default_lock_stale_secs(),
            lock_poll_interval_ms: default_lock_poll_interval_ms(),
        }
    }
}

/// Per (authority, account) issuance rate limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RateLimitConfig {
    pub max_events: usize,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_events: default_rate_limit_events(),
            window_secs: default_rate_limit_window(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetryConfig {
    pub max_duration_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: default_retry_max_duration(),
        }
    }
}

/// OCSP stapling behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OcspConfig {
    pub disable_stapling: bool,
    /// Renew managed certificates whose staple reports them revoked
    pub replace_revoked: bool,
}

impl Default for OcspConfig {
    fn default() -> Self {
        Self {
            disable_stapling: false,
            replace_revoked: true,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl Config {
    /// Load configuration from a KDL file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_kdl_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        info!(
            path = %path.display(),
            on_demand = config.on_demand.is_some(),
            storage = %config.storage.path.display(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse configuration from KDL text
    pub fn from_kdl_str(content: &str) -> Result<Self> {
        kdl::parse_kdl_config(content)
    }

    /// Check the configuration for errors and questionable settings
    pub fn validate(&self) -> ValidationResult {
        validate::validate_config(self)
    }
}
