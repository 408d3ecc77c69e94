//! Block parsers for the configuration file.

use std::path::PathBuf;

use anyhow::Result;
use kdl::KdlNode;
use tracing::trace;

use crate::{
    default_lock_poll_interval_ms, default_lock_stale_secs, default_max_workers,
    default_ocsp_check_interval, default_rate_limit_events, default_rate_limit_window,
    default_renew_check_interval, default_retry_max_duration, default_storage_path, CacheConfig,
    OcspConfig, OnDemandConfig, RateLimitConfig, RetryConfig, StorageConfig,
};

use super::helpers::{
    get_bool_entry, get_string_entry, get_u64_entry, get_usize_entry, string_args,
    warn_unknown_children,
};

/// Parse the `cache { ... }` block
pub fn parse_cache_config(node: &KdlNode) -> Result<CacheConfig> {
    trace!("Parsing cache configuration block");
    warn_unknown_children(
        node,
        &[
            "capacity",
            "renew-check-interval-secs",
            "ocsp-check-interval-secs",
            "max-workers",
        ],
    );

    let config = CacheConfig {
        capacity: get_usize_entry(node, "capacity")?.unwrap_or(0),
        renew_check_interval_secs: get_u64_entry(node, "renew-check-interval-secs")?
            .unwrap_or_else(default_renew_check_interval),
        ocsp_check_interval_secs: get_u64_entry(node, "ocsp-check-interval-secs")?
            .unwrap_or_else(default_ocsp_check_interval),
        max_workers: get_usize_entry(node, "max-workers")?.unwrap_or_else(default_max_workers),
    };

    trace!(
        capacity = config.capacity,
        renew_check_interval_secs = config.renew_check_interval_secs,
        ocsp_check_interval_secs = config.ocsp_check_interval_secs,
        max_workers = config.max_workers,
        "Parsed cache configuration"
    );
    Ok(config)
}

/// Parse the `on-demand { allow ... }` block
pub fn parse_on_demand_config(node: &KdlNode) -> Result<OnDemandConfig> {
    trace!("Parsing on-demand configuration block");
    warn_unknown_children(node, &["allow"]);

    let mut allow = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "allow" {
                allow.extend(string_args(child)?);
            }
        }
    }

    trace!(allowed = allow.len(), "Parsed on-demand configuration");
    Ok(OnDemandConfig { allow })
}

/// Parse the `storage { ... }` block
pub fn parse_storage_config(node: &KdlNode) -> Result<StorageConfig> {
    trace!("Parsing storage configuration block");
    warn_unknown_children(node, &["path", "lock-stale-secs", "lock-poll-interval-ms"]);

    let config = StorageConfig {
        path: get_string_entry(node, "path")?
            .map(PathBuf::from)
            .unwrap_or_else(default_storage_path),
        lock_stale_secs: get_u64_entry(node, "lock-stale-secs")?
            .unwrap_or_else(default_lock_stale_secs),
        lock_poll_interval_ms: get_u64_entry(node, "lock-poll-interval-ms")?
            .unwrap_or_else(default_lock_poll_interval_ms),
    };

    trace!(path = %config.path.display(), "Parsed storage configuration");
    Ok(config)
}

/// Parse the `rate-limit { ... }` block
pub fn parse_rate_limit_config(node: &KdlNode) -> Result<RateLimitConfig> {
    trace!("Parsing rate-limit configuration block");
    warn_unknown_children(node, &["max-events", "window-secs"]);

    Ok(RateLimitConfig {
        max_events: get_usize_entry(node, "max-events")?
            .unwrap_or_else(default_rate_limit_events),
        window_secs: get_u64_entry(node, "window-secs")?
            .unwrap_or_else(default_rate_limit_window),
    })
}

/// Parse the `retry { ... }` block
pub fn parse_retry_config(node: &KdlNode) -> Result<RetryConfig> {
    warn_unknown_children(node, &["max-duration-secs"]);

    Ok(RetryConfig {
        max_duration_secs: get_u64_entry(node, "max-duration-secs")?
            .unwrap_or_else(default_retry_max_duration),
    })
}

/// Parse the `ocsp { ... }` block
pub fn parse_ocsp_config(node: &KdlNode) -> Result<OcspConfig> {
    warn_unknown_children(node, &["disable-stapling", "replace-revoked"]);

    let defaults = OcspConfig::default();
    Ok(OcspConfig {
        disable_stapling: get_bool_entry(node, "disable-stapling")?
            .unwrap_or(defaults.disable_stapling),
        replace_revoked: get_bool_entry(node, "replace-revoked")?
            .unwrap_or(defaults.replace_revoked),
    })
}
