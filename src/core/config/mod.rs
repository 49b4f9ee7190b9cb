#![allow(clippy::result_large_err)]

use crate::core::dataset::{ColumnSpec, SourceSchema};
use crate::core::error::AppError;
use crate::core::extract::ExtractOptions;
use crate::core::load::{ScopeMode, StoreConfig};
use crate::core::pipeline_graph::{PipelineGraph, PipelineSettings, RetryPolicy, StageId};
use crate::core::transform::{TransformOptions, DEFAULT_DATE_FORMAT, DEFAULT_MAX_DROP_FRACTION};
use crate::core::types::ErrorCategory;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

pub mod loader;
pub mod validation;

pub use loader::ConfigLoader;
pub use validation::ConfigValidator;

/// File name looked up in the workspace root.
pub const CONFIG_FILE_NAME: &str = "covid-etl.toml";

/// Pipeline configuration loaded from covid-etl.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CovidEtlConfig {
    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub transform: TransformConfig,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub load: LoadConfig,

    #[serde(default)]
    pub run: RunConfig,

    /// Per-stage retry and timeout overrides keyed by stage name.
    #[serde(default)]
    pub stages: BTreeMap<String, StageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_path")]
    pub path: PathBuf,

    /// Single ASCII character, or `tab`.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    /// Tried in order for every date field.
    #[serde(default = "default_date_formats")]
    pub date_formats: Vec<String>,

    #[serde(default = "default_io_timeout")]
    pub io_timeout: String,

    /// Column layout of the source file; the NYT us-states layout when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<ColumnSpec>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default = "default_max_drop_fraction")]
    pub max_drop_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_store_url")]
    pub url: String,

    #[serde(default = "default_store_table")]
    pub table: String,

    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: String,

    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: String,

    #[serde(default = "default_write_timeout")]
    pub write_timeout: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoadConfig {
    #[serde(default)]
    pub scope: ScopeMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Root of run records and staging artifacts.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

/// Retry and timeout overrides for one stage; unset keys keep the defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry_delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

fn default_source_path() -> PathBuf {
    PathBuf::from("data/raw_data.csv")
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_date_formats() -> Vec<String> {
    vec![DEFAULT_DATE_FORMAT.to_string()]
}

fn default_io_timeout() -> String {
    "30s".to_string()
}

fn default_max_drop_fraction() -> f64 {
    DEFAULT_MAX_DROP_FRACTION
}

fn default_store_url() -> String {
    StoreConfig::default().url
}

fn default_store_table() -> String {
    StoreConfig::default().table
}

fn default_acquire_timeout() -> String {
    "10s".to_string()
}

fn default_busy_timeout() -> String {
    "5s".to_string()
}

fn default_write_timeout() -> String {
    "60s".to_string()
}

fn default_max_connections() -> u32 {
    StoreConfig::default().max_connections
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".covid-etl/state")
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            path: default_source_path(),
            delimiter: default_delimiter(),
            date_formats: default_date_formats(),
            io_timeout: default_io_timeout(),
            columns: None,
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        TransformConfig {
            max_drop_fraction: default_max_drop_fraction(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            url: default_store_url(),
            table: default_store_table(),
            acquire_timeout: default_acquire_timeout(),
            busy_timeout: default_busy_timeout(),
            write_timeout: default_write_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            state_dir: default_state_dir(),
        }
    }
}

/// Parse a humantime duration, naming the offending key on failure.
pub fn parse_duration(key: &str, value: &str) -> Result<Duration, AppError> {
    humantime::parse_duration(value.trim()).map_err(|e| {
        AppError::new(
            ErrorCategory::ValidationError,
            format!("{} is not a valid duration ('{}'): {}", key, value, e),
        )
        .with_code("CFG-DUR-001")
        .with_context("key", key)
    })
}

/// Resolve a configured delimiter to its byte.
pub fn parse_delimiter(value: &str) -> Result<u8, AppError> {
    let resolved = match value {
        "tab" | "\\t" => "\t",
        other => other,
    };
    match resolved.as_bytes() {
        [byte] if byte.is_ascii() && *byte != b'"' && *byte != b'\n' && *byte != b'\r' => Ok(*byte),
        _ => Err(AppError::new(
            ErrorCategory::ValidationError,
            format!("source.delimiter must be a single ASCII character, got '{}'", value),
        )
        .with_code("CFG-SOURCE-001")),
    }
}

impl CovidEtlConfig {
    pub fn schema(&self) -> Result<SourceSchema, AppError> {
        match &self.source.columns {
            Some(columns) => SourceSchema::new(columns.clone()),
            None => Ok(SourceSchema::default()),
        }
    }

    pub fn store_config(&self) -> Result<StoreConfig, AppError> {
        Ok(StoreConfig {
            url: self.store.url.clone(),
            table: self.store.table.clone(),
            acquire_timeout: parse_duration("store.acquire_timeout", &self.store.acquire_timeout)?,
            busy_timeout: parse_duration("store.busy_timeout", &self.store.busy_timeout)?,
            write_timeout: parse_duration("store.write_timeout", &self.store.write_timeout)?,
            max_connections: self.store.max_connections,
        })
    }

    /// Runtime settings for the standard stages.
    pub fn pipeline_settings(&self) -> Result<PipelineSettings, AppError> {
        Ok(PipelineSettings {
            source_path: self.source.path.clone(),
            schema: self.schema()?,
            extract: ExtractOptions {
                delimiter: parse_delimiter(&self.source.delimiter)?,
                io_timeout: parse_duration("source.io_timeout", &self.source.io_timeout)?,
            },
            transform: TransformOptions {
                date_formats: self.source.date_formats.clone(),
                max_drop_fraction: self.transform.max_drop_fraction,
            },
            store: self.store_config()?,
            scope: self.load.scope,
        })
    }

    /// Standard graph with the `[stages.*]` overrides applied.
    pub fn pipeline_graph(&self) -> Result<PipelineGraph, AppError> {
        let defaults = PipelineGraph::default();
        let mut overrides = HashMap::new();
        for (name, stage) in &self.stages {
            let id: StageId = name.parse().map_err(|_| {
                AppError::new(
                    ErrorCategory::ValidationError,
                    format!("[stages.{}] does not name a pipeline stage", name),
                )
                .with_code("CFG-STAGE-001")
            })?;
            let base = defaults
                .stage(id)
                .map(|spec| (spec.retry.clone(), spec.timeout))
                .unwrap_or_else(|| (RetryPolicy::default(), Duration::from_secs(600)));
            overrides.insert(id, stage.apply(id, base)?);
        }
        PipelineGraph::standard(&overrides)
    }
}

impl StageConfig {
    fn apply(
        &self,
        stage: StageId,
        (mut retry, mut timeout): (RetryPolicy, Duration),
    ) -> Result<(RetryPolicy, Duration), AppError> {
        let key = |field: &str| format!("stages.{}.{}", stage, field);
        if let Some(retries) = self.retries {
            retry.retries = retries;
        }
        if let Some(delay) = &self.retry_delay {
            retry.retry_delay = parse_duration(&key("retry_delay"), delay)?;
            if self.max_retry_delay.is_none() && retry.max_retry_delay < retry.retry_delay {
                retry.max_retry_delay = retry.retry_delay;
            }
        }
        if let Some(multiplier) = self.backoff_multiplier {
            retry.backoff_multiplier = multiplier;
        }
        if let Some(max) = &self.max_retry_delay {
            retry.max_retry_delay = parse_duration(&key("max_retry_delay"), max)?;
        }
        if let Some(jitter) = &self.jitter {
            retry.jitter = parse_duration(&key("jitter"), jitter)?;
        }
        if let Some(value) = &self.timeout {
            timeout = parse_duration(&key("timeout"), value)?;
        }
        Ok((retry, timeout))
    }
}
