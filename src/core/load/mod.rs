//! Idempotent, scoped persistence of transformed records.

pub mod store;

pub use store::{CaseStore, ReplaceOutcome, StoreConfig, StoredRecord};

use crate::core::dataset::{LoadBatch, RunScope};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("store unreachable: {message}")]
    Connectivity { message: String },

    #[error("store busy: {message}")]
    Busy { message: String },

    #[error("store write exceeded the {}s timeout", timeout.as_secs_f64())]
    Timeout { timeout: Duration },

    #[error("constraint violated: {message}")]
    ConstraintViolation { message: String },

    #[error("table {table} is missing columns {missing:?}")]
    SchemaMismatch { table: String, missing: Vec<String> },

    #[error("{column}={value} for {region} on {date} does not fit the store")]
    ValueOutOfRange {
        region: String,
        date: chrono::NaiveDate,
        column: String,
        value: u64,
    },

    #[error("store query failed: {message}")]
    Query { message: String },
}

impl LoadError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LoadError::Connectivity { .. } | LoadError::Busy { .. } | LoadError::Timeout { .. }
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            LoadError::Connectivity { .. } => "LOD-CONN-001",
            LoadError::Busy { .. } => "LOD-CONN-002",
            LoadError::Timeout { .. } => "LOD-TIME-001",
            LoadError::ConstraintViolation { .. } => "LOD-DATA-001",
            LoadError::SchemaMismatch { .. } => "LOD-SCHEMA-001",
            LoadError::ValueOutOfRange { .. } => "LOD-DATA-002",
            LoadError::Query { .. } => "LOD-QUERY-001",
        }
    }
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CANTOPEN: i32 = 14;
const SQLITE_CONSTRAINT: i32 = 19;

impl From<sqlx::Error> for LoadError {
    fn from(err: sqlx::Error) -> Self {
        let message = err.to_string();
        match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_) => LoadError::Connectivity { message },
            sqlx::Error::Database(db) => {
                if db.is_unique_violation()
                    || db.is_check_violation()
                    || db.is_foreign_key_violation()
                {
                    return LoadError::ConstraintViolation { message };
                }
                let primary = db
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| code & 0xff);
                match primary {
                    Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => LoadError::Busy { message },
                    Some(SQLITE_CANTOPEN) => LoadError::Connectivity { message },
                    Some(SQLITE_CONSTRAINT) => LoadError::ConstraintViolation { message },
                    _ if message.contains("database is locked") => LoadError::Busy { message },
                    _ => LoadError::Query { message },
                }
            }
            _ => LoadError::Query { message },
        }
    }
}

impl From<LoadError> for AppError {
    fn from(err: LoadError) -> Self {
        let category = match err {
            LoadError::Timeout { .. } => ErrorCategory::TimeoutError,
            _ => ErrorCategory::LoadError,
        };
        let mut app = AppError::new(category, err.to_string()).with_code(err.code());
        match &err {
            LoadError::SchemaMismatch { table, .. } => app.add_context("table", table),
            LoadError::ValueOutOfRange {
                region,
                date,
                column,
                ..
            } => {
                app.add_context("region", region);
                app.add_context("date", &date.to_string());
                app.add_context("column", column);
            }
            _ => {}
        }
        if err.is_transient() {
            app = app.transient();
        }
        app
    }
}

/// How the overwrite scope of a run is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMode {
    /// Min to max date of the batch.
    #[default]
    BatchRange,
    /// Only the run's logical date; other records in the batch are ignored.
    LogicalDate,
}

impl std::str::FromStr for ScopeMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "batch_range" => Ok(ScopeMode::BatchRange),
            "logical_date" => Ok(ScopeMode::LogicalDate),
            other => Err(format!(
                "unknown load scope '{}', expected batch_range or logical_date",
                other
            )),
        }
    }
}

impl std::fmt::Display for ScopeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeMode::BatchRange => f.write_str("batch_range"),
            ScopeMode::LogicalDate => f.write_str("logical_date"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub scope: Option<RunScope>,
    pub rows_deleted: u64,
    pub rows_inserted: u64,
}

pub struct Loader<'a> {
    store: &'a CaseStore,
    mode: ScopeMode,
    write_timeout: Option<Duration>,
}

impl<'a> Loader<'a> {
    pub fn new(store: &'a CaseStore, mode: ScopeMode) -> Self {
        Self {
            store,
            mode,
            write_timeout: None,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Replace the run's scope with the batch. A batch-range load of an empty
    /// batch has no scope and writes nothing.
    pub async fn load(&self, batch: &LoadBatch) -> Result<LoadSummary, LoadError> {
        let (scope, records) = match self.mode {
            ScopeMode::BatchRange => match batch.scope() {
                Some(scope) => (scope, batch.records.clone()),
                None => {
                    tracing::info!("empty batch, nothing to load");
                    return Ok(LoadSummary::default());
                }
            },
            ScopeMode::LogicalDate => (
                RunScope::single(batch.logical_date),
                batch
                    .records
                    .iter()
                    .filter(|r| r.date == batch.logical_date)
                    .cloned()
                    .collect(),
            ),
        };

        let replace = self
            .store
            .replace_scope(scope, &records, batch.logical_date, Utc::now());
        let outcome = match self.write_timeout {
            Some(timeout) => tokio::time::timeout(timeout, replace)
                .await
                .map_err(|_| LoadError::Timeout { timeout })??,
            None => replace.await?,
        };

        tracing::info!(
            table = self.store.table(),
            scope = %scope,
            rows_deleted = outcome.rows_deleted,
            rows_inserted = outcome.rows_inserted,
            "replaced run scope"
        );
        Ok(LoadSummary {
            scope: Some(scope),
            rows_deleted: outcome.rows_deleted,
            rows_inserted: outcome.rows_inserted,
        })
    }
}

/// Open the store, load the batch and close the store again whatever the
/// outcome.
pub async fn load_batch(
    config: &StoreConfig,
    mode: ScopeMode,
    batch: &LoadBatch,
) -> Result<LoadSummary, LoadError> {
    let store = CaseStore::connect(config).await?;
    let result = async {
        store.ensure_schema().await?;
        Loader::new(&store, mode)
            .with_write_timeout(config.write_timeout)
            .load(batch)
            .await
    }
    .await;
    store.close().await;
    result
}
