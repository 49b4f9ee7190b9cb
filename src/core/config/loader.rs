#![allow(clippy::result_large_err)]

use super::{CovidEtlConfig, CONFIG_FILE_NAME};
use crate::core::error::AppError;
use crate::core::load::ScopeMode;
use crate::core::types::ErrorCategory;
use std::env;
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load config from workspace root (workspace/covid-etl.toml)
    /// Environment variables override config file values
    pub fn load_from_workspace(workspace_path: &Path) -> Result<CovidEtlConfig, AppError> {
        let config_path = workspace_path.join(CONFIG_FILE_NAME);
        let mut config = Self::load_from_file(&config_path)?.unwrap_or_default();
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Load an explicitly named config file; unlike the workspace lookup, a
    /// missing file is an error.
    pub fn load_explicit(path: &Path) -> Result<CovidEtlConfig, AppError> {
        let mut config = Self::load_from_file(path)?.ok_or_else(|| {
            AppError::new(
                ErrorCategory::IoError,
                format!("config file {} does not exist", path.display()),
            )
            .with_code("CFG-LOAD-001")
        })?;
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    /// `--config` wins over the workspace file.
    pub fn load(
        workspace_path: &Path,
        explicit: Option<&Path>,
    ) -> Result<CovidEtlConfig, AppError> {
        match explicit {
            Some(path) => Self::load_explicit(path),
            None => Self::load_from_workspace(workspace_path),
        }
    }

    /// Load config from specific file path
    /// Returns Ok(None) if file doesn't exist
    pub fn load_from_file(path: &Path) -> Result<Option<CovidEtlConfig>, AppError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::new(
                ErrorCategory::IoError,
                format!("Failed to read config file {}: {}", path.display(), e),
            )
            .with_code("CFG-LOAD-002")
        })?;

        let config: CovidEtlConfig = toml::from_str(&content).map_err(|e| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("Failed to parse config file {}: {}", path.display(), e),
            )
            .with_code("CFG-LOAD-003")
        })?;

        tracing::debug!(path = %path.display(), "loaded configuration file");
        Ok(Some(config))
    }

    /// Environment variables take precedence over config file values.
    /// Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(config: &mut CovidEtlConfig) {
        if let Ok(path) = env::var("COVID_ETL_SOURCE_PATH") {
            config.source.path = PathBuf::from(path);
        }

        if let Ok(delimiter) = env::var("COVID_ETL_SOURCE_DELIMITER") {
            config.source.delimiter = delimiter;
        }

        if let Ok(url) = env::var("COVID_ETL_STORE_URL") {
            config.store.url = url;
        }

        if let Ok(table) = env::var("COVID_ETL_STORE_TABLE") {
            config.store.table = table;
        }

        if let Ok(raw) = env::var("COVID_ETL_MAX_DROP_FRACTION") {
            match raw.trim().parse::<f64>() {
                Ok(fraction) => config.transform.max_drop_fraction = fraction,
                Err(_) => tracing::warn!(value = %raw, "ignoring COVID_ETL_MAX_DROP_FRACTION"),
            }
        }

        if let Ok(raw) = env::var("COVID_ETL_LOAD_SCOPE") {
            match raw.parse::<ScopeMode>() {
                Ok(scope) => config.load.scope = scope,
                Err(reason) => {
                    tracing::warn!(value = %raw, %reason, "ignoring COVID_ETL_LOAD_SCOPE")
                }
            }
        }

        if let Ok(state_dir) = env::var("COVID_ETL_STATE_DIR") {
            config.run.state_dir = PathBuf::from(state_dir);
        }
    }

    /// Get documentation for supported environment variables
    pub fn env_var_documentation() -> &'static [&'static str] {
        &[
            "COVID_ETL_SOURCE_PATH - Override the raw source file (default: data/raw_data.csv)",
            "COVID_ETL_SOURCE_DELIMITER - Override the field delimiter (default: ,)",
            "COVID_ETL_STORE_URL - Override the SQLite store URL (default: sqlite://data/processed/cases.db)",
            "COVID_ETL_STORE_TABLE - Override the target table (default: case_records)",
            "COVID_ETL_MAX_DROP_FRACTION - Override the tolerated dropped-row fraction (default: 0.10)",
            "COVID_ETL_LOAD_SCOPE - Override the overwrite scope (batch_range/logical_date)",
            "COVID_ETL_STATE_DIR - Override the run state directory (default: .covid-etl/state)",
        ]
    }
}
