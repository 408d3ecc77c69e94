//! Storage location and lock settings validation

use std::path::Path;

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;

/// Validate the storage block
pub fn validate_storage(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let storage = &config.storage;

    if storage.path.as_os_str().is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Storage,
            "storage path must not be empty",
        ));
    } else {
        check_path(&storage.path, &mut result);
    }

    if storage.lock_stale_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Storage,
            "lock-stale-secs must be greater than zero",
        ));
    } else if storage.lock_stale_secs < 60 {
        result.add_warning(ValidationWarning::new(format!(
            "lock-stale-secs {} is shorter than a typical issuance; live locks may be stolen",
            storage.lock_stale_secs
        )));
    }

    if storage.lock_poll_interval_ms == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Storage,
            "lock-poll-interval-ms must be greater than zero",
        ));
    }

    result
}

fn check_path(path: &Path, result: &mut ValidationResult) {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Storage,
                format!("Storage path is not a directory: {:?}", path),
            ));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            result.add_warning(ValidationWarning::new(format!(
                "Storage path {:?} does not exist and will be created",
                path
            )));
        }
        Err(e) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Storage,
                format!("Cannot access storage path {:?}: {}", path, e),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_path_is_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let mut config = Config::default();
        config.storage.path = file;

        let result = validate_storage(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("not a directory")));
    }

    #[test]
    fn test_missing_storage_path_warns() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.path = dir.path().join("certs");

        let result = validate_storage(&config);
        assert!(result.is_valid());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("will be created")));
    }

    #[test]
    fn test_lock_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.path = dir.path().to_path_buf();
        config.storage.lock_stale_secs = 0;
        config.storage.lock_poll_interval_ms = 0;

        let result = validate_storage(&config);
        assert_eq!(result.errors.len(), 2);
    }
}
