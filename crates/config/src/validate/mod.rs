//! Configuration validation
//!
//! Checks are grouped by concern and merged into one [`ValidationResult`].
//! Errors make a configuration unusable; warnings flag settings that work
//! but are likely mistakes.

use std::fmt;

use thiserror::Error;

use crate::Config;

mod lint;
mod settings;
mod storage;

pub use lint::lint_config;
pub use settings::validate_settings;
pub use storage::validate_storage;

/// Area of the configuration an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Cache,
    Renewal,
    OnDemand,
    Storage,
    RateLimit,
    Retry,
    Ocsp,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Cache => "cache",
            ErrorCategory::Renewal => "renewal",
            ErrorCategory::OnDemand => "on-demand",
            ErrorCategory::Storage => "storage",
            ErrorCategory::RateLimit => "rate-limit",
            ErrorCategory::Retry => "retry",
            ErrorCategory::Ocsp => "ocsp",
        };
        f.write_str(name)
    }
}

/// A setting that makes the configuration unusable
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{category}] {message}")]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// A setting that works but is probably not what was intended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Collected errors and warnings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Append another result's findings
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// True if there are no errors (warnings are allowed)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Run every check
pub fn validate_config(config: &Config) -> ValidationResult {
    let mut result = validate_settings(config);
    result.merge(validate_storage(config));
    result.merge(lint_config(config));

    tracing::debug!(
        errors = result.errors.len(),
        warnings = result.warnings.len(),
        "Configuration validated"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let mut config = Config::default();
        config.storage.path = std::env::temp_dir();
        let result = validate_config(&config);
        assert!(result.is_valid(), "unexpected errors: {:?}", result.errors);
    }

    #[test]
    fn test_merge_keeps_both_sides() {
        let mut a = ValidationResult::new();
        a.add_error(ValidationError::new(ErrorCategory::Cache, "bad"));
        let mut b = ValidationResult::new();
        b.add_warning(ValidationWarning::new("odd"));

        a.merge(b);
        assert_eq!(a.errors.len(), 1);
        assert_eq!(a.warnings.len(), 1);
        assert!(!a.is_valid());
        assert_eq!(a.errors[0].to_string(), "[cache] bad");
    }
}
