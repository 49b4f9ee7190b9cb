//! SQLite-backed case store.

use super::LoadError;
use crate::core::dataset::{CleanedRecord, RunScope};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_TABLE: &str = "case_records";

/// Columns the target table must carry, in insert order.
pub const STORE_COLUMNS: [&str; 8] = [
    "region",
    "date",
    "cases",
    "deaths",
    "new_cases",
    "new_deaths",
    "run_date",
    "loaded_at",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub url: String,
    pub table: String,
    pub acquire_timeout: Duration,
    pub busy_timeout: Duration,
    /// Upper bound for one scoped replace, transaction included.
    pub write_timeout: Duration,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/processed/cases.db".to_string(),
            table: DEFAULT_TABLE.to_string(),
            acquire_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(60),
            max_connections: 2,
        }
    }
}

/// True when `name` can be spliced into SQL as a bare identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One persisted row as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StoredRecord {
    pub region: String,
    pub date: NaiveDate,
    pub cases: i64,
    pub deaths: i64,
    pub new_cases: i64,
    pub new_deaths: i64,
    pub run_date: NaiveDate,
    pub loaded_at: DateTime<Utc>,
}

/// Row counts of one committed scoped replace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub rows_deleted: u64,
    pub rows_inserted: u64,
}

/// Scoped handle on the relational store. Opened per load attempt and closed
/// on every exit path.
pub struct CaseStore {
    pool: SqlitePool,
    table: String,
}

impl CaseStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, LoadError> {
        if !is_valid_identifier(&config.table) {
            return Err(LoadError::Query {
                message: format!("invalid table name '{}'", config.table),
            });
        }
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|err| LoadError::Connectivity {
                message: format!("invalid store url '{}': {}", config.url, err),
            })?
            .create_if_missing(true)
            .busy_timeout(config.busy_timeout);

        let filename = options.get_filename().to_path_buf();
        let in_memory = filename.as_os_str() == ":memory:";
        let options = if in_memory {
            options
        } else {
            if let Some(parent) = filename.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|err| LoadError::Connectivity {
                    message: format!("cannot create {}: {}", parent.display(), err),
                })?;
            }
            options.journal_mode(SqliteJournalMode::Wal)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(LoadError::from)?;

        tracing::debug!(url = %config.url, table = %config.table, "opened case store");
        Ok(Self {
            pool,
            table: config.table.clone(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the table when absent and verify an existing one carries every
    /// expected column.
    pub async fn ensure_schema(&self) -> Result<(), LoadError> {
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                region TEXT NOT NULL,
                date TEXT NOT NULL,
                cases INTEGER NOT NULL CHECK (cases >= 0),
                deaths INTEGER NOT NULL CHECK (deaths >= 0),
                new_cases INTEGER NOT NULL CHECK (new_cases >= 0),
                new_deaths INTEGER NOT NULL CHECK (new_deaths >= 0),
                run_date TEXT NOT NULL,
                loaded_at TEXT NOT NULL,
                PRIMARY KEY (region, date)
            )",
            table = self.table
        );
        sqlx::query(&create).execute(&self.pool).await?;

        let rows = sqlx::query(&format!("PRAGMA table_info({})", self.table))
            .fetch_all(&self.pool)
            .await?;
        let mut present = BTreeSet::new();
        for row in rows {
            let name: String = row.try_get("name")?;
            present.insert(name);
        }
        let missing: Vec<String> = STORE_COLUMNS
            .iter()
            .filter(|column| !present.contains(**column))
            .map(|column| column.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(LoadError::SchemaMismatch {
                table: self.table.clone(),
                missing,
            });
        }
        Ok(())
    }

    /// Delete every row dated inside `scope` and insert `records`, in one
    /// transaction. Nothing is visible to readers unless both steps succeed.
    pub async fn replace_scope(
        &self,
        scope: RunScope,
        records: &[CleanedRecord],
        run_date: NaiveDate,
        loaded_at: DateTime<Utc>,
    ) -> Result<ReplaceOutcome, LoadError> {
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            rows.push(StoredRecord::from_cleaned(record, run_date, loaded_at)?);
        }

        let delete = format!(
            "DELETE FROM {} WHERE date >= ? AND date <= ?",
            self.table
        );
        let insert = format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            self.table,
            STORE_COLUMNS.join(", ")
        );

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(&delete)
            .bind(scope.start)
            .bind(scope.end)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let mut inserted = 0u64;
        for row in &rows {
            inserted += sqlx::query(&insert)
                .bind(&row.region)
                .bind(row.date)
                .bind(row.cases)
                .bind(row.deaths)
                .bind(row.new_cases)
                .bind(row.new_deaths)
                .bind(row.run_date)
                .bind(row.loaded_at)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        Ok(ReplaceOutcome {
            rows_deleted: deleted,
            rows_inserted: inserted,
        })
    }

    pub async fn fetch_all(&self) -> Result<Vec<StoredRecord>, LoadError> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY region, date",
            STORE_COLUMNS.join(", "),
            self.table
        );
        Ok(sqlx::query_as::<_, StoredRecord>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn fetch_range(&self, scope: RunScope) -> Result<Vec<StoredRecord>, LoadError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE date >= ? AND date <= ? ORDER BY region, date",
            STORE_COLUMNS.join(", "),
            self.table
        );
        Ok(sqlx::query_as::<_, StoredRecord>(&sql)
            .bind(scope.start)
            .bind(scope.end)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn count(&self) -> Result<u64, LoadError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    pub async fn close(self) {
        self.pool.close().await;
        tracing::debug!(table = %self.table, "closed case store");
    }
}

impl StoredRecord {
    fn from_cleaned(
        record: &CleanedRecord,
        run_date: NaiveDate,
        loaded_at: DateTime<Utc>,
    ) -> Result<Self, LoadError> {
        let int = |column: &str, value: u64| {
            i64::try_from(value).map_err(|_| LoadError::ValueOutOfRange {
                region: record.region.clone(),
                date: record.date,
                column: column.to_string(),
                value,
            })
        };
        Ok(Self {
            region: record.region.clone(),
            date: record.date,
            cases: int("cases", record.cases)?,
            deaths: int("deaths", record.deaths)?,
            new_cases: int("new_cases", record.new_cases)?,
            new_deaths: int("new_deaths", record.new_deaths)?,
            run_date,
            loaded_at,
        })
    }
}
