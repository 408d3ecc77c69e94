//! Numeric and policy settings validation

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;

/// Lifetime of a typical ACME certificate, used to judge check intervals
const TYPICAL_LIFETIME_SECS: f64 = 90.0 * 24.0 * 3600.0;

/// Validate intervals, ratios and limits
pub fn validate_settings(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    let ratio = config.renewal_window_ratio;
    if !(ratio > 0.0 && ratio < 1.0) {
        result.add_error(ValidationError::new(
            ErrorCategory::Renewal,
            format!("renewal-window-ratio must be between 0 and 1 (exclusive), got {}", ratio),
        ));
    }

    if config.cache.renew_check_interval_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Cache,
            "renew-check-interval-secs must be greater than zero",
        ));
    } else if ratio > 0.0 && ratio < 1.0 {
        // Renewal should get several chances inside the window
        let window_secs = TYPICAL_LIFETIME_SECS * ratio;
        if config.cache.renew_check_interval_secs as f64 > window_secs / 3.0 {
            result.add_warning(ValidationWarning::new(format!(
                "renew-check-interval-secs {} leaves fewer than three checks inside the renewal window of a 90-day certificate",
                config.cache.renew_check_interval_secs
            )));
        }
    }

    if config.cache.ocsp_check_interval_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Cache,
            "ocsp-check-interval-secs must be greater than zero",
        ));
    }

    if config.cache.max_workers == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Cache,
            "max-workers must be greater than zero",
        ));
    }

    if config.rate_limit.max_events == 0 && config.rate_limit.window_secs > 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::RateLimit,
            "max-events 0 with a non-zero window admits no issuance at all",
        ));
    }

    if config.retry.max_duration_secs == 0 {
        result.add_warning(ValidationWarning::new(
            "retry max-duration-secs is 0; failed operations are attempted only once",
        ));
    }

    if config.must_staple && config.ocsp.disable_stapling {
        result.add_error(ValidationError::new(
            ErrorCategory::Ocsp,
            "must-staple certificates require OCSP stapling; remove disable-stapling",
        ));
    }

    if let Some(name) = &config.default_server_name {
        if name.trim().is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::OnDemand,
                "default-server-name must not be empty",
            ));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_error(result: &ValidationResult, category: ErrorCategory, text: &str) -> bool {
        result
            .errors
            .iter()
            .any(|e| e.category == category && e.message.contains(text))
    }

    #[test]
    fn test_ratio_out_of_range() {
        for ratio in [0.0, 1.0, -0.5, 1.5, f64::NAN] {
            let config = Config {
                renewal_window_ratio: ratio,
                ..Default::default()
            };
            let result = validate_settings(&config);
            assert!(
                has_error(&result, ErrorCategory::Renewal, "renewal-window-ratio"),
                "ratio {} accepted",
                ratio
            );
        }
    }

    #[test]
    fn test_zero_intervals() {
        let mut config = Config::default();
        config.cache.renew_check_interval_secs = 0;
        config.cache.ocsp_check_interval_secs = 0;

        let result = validate_settings(&config);
        assert!(has_error(&result, ErrorCategory::Cache, "renew-check-interval-secs"));
        assert!(has_error(&result, ErrorCategory::Cache, "ocsp-check-interval-secs"));
    }

    #[test]
    fn test_rate_limit_that_admits_nothing() {
        let mut config = Config::default();
        config.rate_limit.max_events = 0;
        assert!(has_error(
            &validate_settings(&config),
            ErrorCategory::RateLimit,
            "admits no issuance"
        ));

        // Zero events and zero window means unthrottled
        config.rate_limit.window_secs = 0;
        assert!(validate_settings(&config).is_valid());
    }

    #[test]
    fn test_long_renew_interval_warns() {
        let mut config = Config::default();
        config.cache.renew_check_interval_secs = 15 * 24 * 3600;

        let result = validate_settings(&config);
        assert!(result.is_valid());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("fewer than three checks")));
    }

    #[test]
    fn test_must_staple_without_stapling() {
        let mut config = Config::default();
        config.must_staple = true;
        config.ocsp.disable_stapling = true;
        assert!(has_error(&validate_settings(&config), ErrorCategory::Ocsp, "must-staple"));
    }
}
