#![allow(clippy::result_large_err)]

use super::{parse_delimiter, parse_duration, CovidEtlConfig};
use crate::core::error::AppError;
use crate::core::load::store::is_valid_identifier;
use crate::core::types::ErrorCategory;

pub struct ConfigValidator;

fn invalid(code: &str, message: impl Into<String>) -> AppError {
    AppError::new(ErrorCategory::ValidationError, message).with_code(code)
}

impl ConfigValidator {
    /// Validate configuration rules
    pub fn validate(config: &CovidEtlConfig) -> Result<(), AppError> {
        if config.source.path.as_os_str().is_empty() {
            return Err(invalid("CFG-SOURCE-002", "source.path cannot be empty"));
        }
        parse_delimiter(&config.source.delimiter)?;
        if config.source.date_formats.iter().all(|f| f.trim().is_empty()) {
            return Err(invalid(
                "CFG-SOURCE-003",
                "source.date_formats must list at least one format",
            ));
        }
        config.schema()?;

        let fraction = config.transform.max_drop_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(invalid(
                "CFG-TRANSFORM-001",
                format!("transform.max_drop_fraction must be within [0, 1], got {}", fraction),
            ));
        }

        if config.store.url.trim().is_empty() {
            return Err(invalid("CFG-STORE-001", "store.url cannot be empty"));
        }
        if !is_valid_identifier(&config.store.table) {
            return Err(invalid(
                "CFG-STORE-002",
                format!("store.table '{}' is not a valid SQL identifier", config.store.table),
            ));
        }
        if config.store.max_connections == 0 {
            return Err(invalid("CFG-STORE-003", "store.max_connections must be at least 1"));
        }

        for (key, value) in [
            ("source.io_timeout", &config.source.io_timeout),
            ("store.acquire_timeout", &config.store.acquire_timeout),
            ("store.write_timeout", &config.store.write_timeout),
        ] {
            if parse_duration(key, value)?.is_zero() {
                return Err(invalid("CFG-DUR-002", format!("{} must be greater than zero", key)));
            }
        }
        parse_duration("store.busy_timeout", &config.store.busy_timeout)?;

        if config.run.state_dir.as_os_str().is_empty() {
            return Err(invalid("CFG-RUN-001", "run.state_dir cannot be empty"));
        }

        config.pipeline_graph()?;
        Ok(())
    }
}
