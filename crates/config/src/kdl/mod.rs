//! KDL configuration parsing.

use anyhow::{anyhow, Context, Result};
use kdl::KdlDocument;
use tracing::{trace, warn};

use crate::Config;

mod helpers;
mod sections;

pub use helpers::{get_bool_entry, get_string_entry, get_u64_entry, get_usize_entry};
use helpers::{node_bool, node_f64, node_string};
use sections::*;

/// Parse a full configuration document.
///
/// Absent blocks and settings keep their defaults. Unknown nodes are
/// logged and ignored; values of the wrong type are errors.
pub fn parse_kdl_config(content: &str) -> Result<Config> {
    let doc: KdlDocument = content.parse().map_err(|e: kdl::KdlError| {
        // miette renders the offending span with context
        anyhow!("{:?}", miette::Report::new(e))
    })?;

    let mut config = Config::default();

    for node in doc.nodes() {
        let name = node.name().value();
        trace!(node = %name, "Parsing top-level configuration node");

        match name {
            "cache" => config.cache = parse_cache_config(node).context("Invalid 'cache' block")?,
            "renewal-window-ratio" => config.renewal_window_ratio = node_f64(node)?,
            "default-server-name" => config.default_server_name = Some(node_string(node)?),
            "on-demand" => {
                config.on_demand =
                    Some(parse_on_demand_config(node).context("Invalid 'on-demand' block")?)
            }
            "storage" => {
                config.storage = parse_storage_config(node).context("Invalid 'storage' block")?
            }
            "rate-limit" => {
                config.rate_limit =
                    parse_rate_limit_config(node).context("Invalid 'rate-limit' block")?
            }
            "retry" => config.retry = parse_retry_config(node).context("Invalid 'retry' block")?,
            "ocsp" => config.ocsp = parse_ocsp_config(node).context("Invalid 'ocsp' block")?,
            "must-staple" => config.must_staple = node_bool(node)?,
            other => {
                warn!(node = %other, "Unknown configuration node; ignoring");
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_full_config() {
        let config = parse_kdl_config(
            r#"
            cache {
                capacity 500
                renew-check-interval-secs 300
                ocsp-check-interval-secs 1800
                max-workers 64
            }
            renewal-window-ratio 0.25
            default-server-name "example.com"
            on-demand {
                allow "a.example.com" "b.example.com"
                allow "c.example.com"
            }
            storage {
                path "/srv/certs"
                lock-stale-secs 600
                lock-poll-interval-ms 250
            }
            rate-limit {
                max-events 5
                window-secs 60
            }
            retry {
                max-duration-secs 86400
            }
            ocsp {
                disable-stapling #true
                replace-revoked #false
            }
            must-staple #true
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.capacity, 500);
        assert_eq!(config.cache.renew_check_interval_secs, 300);
        assert_eq!(config.cache.ocsp_check_interval_secs, 1800);
        assert_eq!(config.cache.max_workers, 64);
        assert!((config.renewal_window_ratio - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.default_server_name.as_deref(), Some("example.com"));
        assert_eq!(
            config.on_demand.unwrap().allow,
            vec!["a.example.com", "b.example.com", "c.example.com"]
        );
        assert_eq!(config.storage.path, PathBuf::from("/srv/certs"));
        assert_eq!(config.storage.lock_stale_secs, 600);
        assert_eq!(config.storage.lock_poll_interval_ms, 250);
        assert_eq!(config.rate_limit.max_events, 5);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.retry.max_duration_secs, 86400);
        assert!(config.ocsp.disable_stapling);
        assert!(!config.ocsp.replace_revoked);
        assert!(config.must_staple);
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(parse_kdl_config("").unwrap(), Config::default());
    }

    #[test]
    fn test_empty_on_demand_block_enables_on_demand() {
        let config = parse_kdl_config("on-demand {\n}\n").unwrap();
        assert_eq!(config.on_demand.unwrap().allow, Vec::<String>::new());
    }

    #[test]
    fn test_partial_block_keeps_defaults() {
        let config = parse_kdl_config("cache {\n    capacity 2\n}\n").unwrap();
        assert_eq!(config.cache.capacity, 2);
        assert_eq!(config.cache.renew_check_interval_secs, 600);
    }

    #[test]
    fn test_unknown_nodes_are_ignored() {
        let config = parse_kdl_config("listeners {\n}\ncache {\n    colour \"red\"\n}\n").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_integer_ratio_accepted() {
        let config = parse_kdl_config("renewal-window-ratio 1\n").unwrap();
        assert!((config.renewal_window_ratio - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_wrong_type_is_error() {
        let err = parse_kdl_config("cache {\n    capacity \"lots\"\n}\n").unwrap_err();
        assert!(format!("{:#}", err).contains("non-negative integer"));
    }

    #[test]
    fn test_negative_number_is_error() {
        assert!(parse_kdl_config("rate-limit {\n    window-secs -5\n}\n").is_err());
    }

    #[test]
    fn test_syntax_error() {
        assert!(parse_kdl_config("cache {\n    capacity 2\n").is_err());
    }

    #[test]
    fn test_bare_bool_node_means_true() {
        let config = parse_kdl_config("must-staple\n").unwrap();
        assert!(config.must_staple);
    }
}
