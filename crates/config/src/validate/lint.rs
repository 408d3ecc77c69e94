//! Configuration linting for best practices
//!
//! Flags settings that are legal but risky in production.

use super::{ValidationResult, ValidationWarning};
use crate::Config;

/// Lint configuration for best practices
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if let Some(on_demand) = &config.on_demand {
        // Without an allow list every SNI value can trigger issuance
        if on_demand.allow.is_empty() {
            result.add_warning(ValidationWarning::new(
                "on-demand issuance has no allow list; install a decision callback or clients can trigger issuance for arbitrary names",
            ));
        }

        if config.cache.capacity > 0 && config.cache.capacity < on_demand.allow.len() {
            result.add_warning(ValidationWarning::new(format!(
                "cache capacity {} is smaller than the {} allowed on-demand names; certificates will be evicted and reloaded repeatedly",
                config.cache.capacity,
                on_demand.allow.len()
            )));
        }

        for name in &on_demand.allow {
            if name.contains(char::is_whitespace) || name.starts_with('.') || name.ends_with('.') {
                result.add_warning(ValidationWarning::new(format!(
                    "on-demand allow entry '{}' can never match a handshake name",
                    name
                )));
            }
        }
    }

    if !config.ocsp.replace_revoked {
        result.add_warning(ValidationWarning::new(
            "replace-revoked is disabled; revoked certificates will keep being served until they expire",
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OnDemandConfig;

    #[test]
    fn test_lint_on_demand_without_allow_list() {
        let config = Config {
            on_demand: Some(OnDemandConfig::default()),
            ..Default::default()
        };

        let result = lint_config(&config);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("no allow list")));
    }

    #[test]
    fn test_lint_capacity_below_allow_list() {
        let mut config = Config {
            on_demand: Some(OnDemandConfig {
                allow: vec!["a.example.com".into(), "b.example.com".into(), "c.example.com".into()],
            }),
            ..Default::default()
        };
        config.cache.capacity = 2;

        let result = lint_config(&config);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("evicted and reloaded")));
    }

    #[test]
    fn test_lint_unmatchable_allow_entry() {
        let config = Config {
            on_demand: Some(OnDemandConfig {
                allow: vec!["bad name.example.com".into()],
            }),
            ..Default::default()
        };

        let result = lint_config(&config);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("can never match")));
    }

    #[test]
    fn test_lint_replace_revoked_disabled() {
        let mut config = Config::default();
        config.ocsp.replace_revoked = false;

        let result = lint_config(&config);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("replace-revoked")));
    }
}
