//! Coercion, deduplication, derived daily counts and validation of extracted
//! rows.

use crate::core::dataset::{
    CleanedRecord, ColumnRole, FieldError, FieldValue, RawRecord, SourceSchema,
};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";
pub const DEFAULT_MAX_DROP_FRACTION: f64 = 0.10;

/// Every transformation failure is about the data itself, so none of them is
/// retried.
#[derive(Debug, Error)]
pub enum TransformationError {
    #[error("no records to transform")]
    EmptyInput,

    #[error("record at line {line} has {found} fields, schema has {expected}")]
    RecordShape {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error(
        "{dropped} of {input} rows failed coercion ({:.2}% > {:.2}% allowed)",
        fraction * 100.0,
        max_fraction * 100.0
    )]
    DropThresholdExceeded {
        dropped: usize,
        input: usize,
        fraction: f64,
        max_fraction: f64,
        /// First dropped rows in source order.
        samples: Vec<DroppedRow>,
    },

    #[error("required field {column} is empty at line {line}")]
    MissingField { line: u64, column: String },

    #[error("{column} decreased for {region} on {date}: {previous} -> {current}")]
    NonMonotonic {
        region: String,
        date: NaiveDate,
        column: String,
        previous: u64,
        current: u64,
    },
}

impl TransformationError {
    pub fn is_transient(&self) -> bool {
        false
    }

    pub fn code(&self) -> &'static str {
        match self {
            TransformationError::EmptyInput => "TRF-INPUT-001",
            TransformationError::RecordShape { .. } => "TRF-INPUT-002",
            TransformationError::DropThresholdExceeded { .. } => "TRF-DROP-001",
            TransformationError::MissingField { .. } => "TRF-VALID-001",
            TransformationError::NonMonotonic { .. } => "TRF-VALID-002",
        }
    }
}

impl From<TransformationError> for AppError {
    fn from(err: TransformationError) -> Self {
        let mut app = AppError::new(ErrorCategory::TransformationError, err.to_string())
            .with_code(err.code());
        match &err {
            TransformationError::RecordShape { line, .. }
            | TransformationError::MissingField { line, .. } => {
                app.add_context("line", &line.to_string());
            }
            TransformationError::NonMonotonic {
                region,
                date,
                column,
                ..
            } => {
                app.add_context("region", region);
                app.add_context("date", &date.to_string());
                app.add_context("column", column);
            }
            TransformationError::DropThresholdExceeded {
                dropped,
                input,
                samples,
                ..
            } => {
                app.add_context("dropped", &dropped.to_string());
                app.add_context("input", &input.to_string());
                if let Some(first) = samples.first() {
                    app.add_context("line", &first.line.to_string());
                    if let Some(failure) = first.failures.first() {
                        app.add_context("column", &failure.column);
                        app.add_context("raw", &failure.raw);
                        app.add_context("reason", &failure.reason);
                    }
                }
                if !samples.is_empty() {
                    app.add_context("dropped_rows", &describe_dropped(samples));
                }
            }
            TransformationError::EmptyInput => {}
        }
        app
    }
}

/// Dropped rows carried on a threshold failure.
pub const DROP_SAMPLE_LIMIT: usize = 5;

/// `line 3: date='bad': unparseable date; line 9: ...`
fn describe_dropped(rows: &[DroppedRow]) -> String {
    rows.iter()
        .map(|row| {
            let failures: Vec<String> = row.failures.iter().map(|f| f.to_string()).collect();
            format!("line {}: {}", row.line, failures.join(", "))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub date_formats: Vec<String>,
    /// Largest tolerated `dropped / input` ratio; exceeding it fails the run.
    pub max_drop_fraction: f64,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            date_formats: vec![DEFAULT_DATE_FORMAT.to_string()],
            max_drop_fraction: DEFAULT_MAX_DROP_FRACTION,
        }
    }
}

/// Row removed during coercion, with every failing field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedRow {
    pub line: u64,
    pub failures: Vec<FieldError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformCounters {
    pub input_rows: usize,
    pub dropped_rows: usize,
    pub duplicates_removed: usize,
    pub output_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOutput {
    /// Sorted by region, then date.
    pub records: Vec<CleanedRecord>,
    pub counters: TransformCounters,
    pub dropped: Vec<DroppedRow>,
}

/// Required fields of one row after successful coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoercedRow {
    pub line: u64,
    pub date: NaiveDate,
    pub region: String,
    pub cases: u64,
    pub deaths: u64,
}

#[derive(Debug, Clone, Copy)]
struct RoleIndexes {
    date: usize,
    region: usize,
    cases: usize,
    deaths: usize,
}

#[derive(Debug, Clone)]
pub struct Transformer {
    schema: SourceSchema,
    options: TransformOptions,
}

impl Transformer {
    pub fn new(schema: SourceSchema, options: TransformOptions) -> Self {
        Self { schema, options }
    }

    pub fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    pub fn transform(&self, records: &[RawRecord]) -> Result<TransformOutput, TransformationError> {
        if records.is_empty() {
            return Err(TransformationError::EmptyInput);
        }
        let input_rows = records.len();

        let mut coerced = Vec::with_capacity(input_rows);
        let mut dropped = Vec::new();
        for record in records {
            if record.fields.len() != self.schema.len() {
                return Err(TransformationError::RecordShape {
                    line: record.line,
                    expected: self.schema.len(),
                    found: record.fields.len(),
                });
            }
            match self.coerce(record) {
                Ok(row) => coerced.push(row),
                Err(row) => {
                    tracing::debug!(line = row.line, failures = row.failures.len(), "dropping row");
                    dropped.push(row);
                }
            }
        }

        let fraction = dropped.len() as f64 / input_rows as f64;
        if fraction > self.options.max_drop_fraction {
            return Err(TransformationError::DropThresholdExceeded {
                dropped: dropped.len(),
                input: input_rows,
                fraction,
                max_fraction: self.options.max_drop_fraction,
                samples: dropped.iter().take(DROP_SAMPLE_LIMIT).cloned().collect(),
            });
        }

        let coerced_rows = coerced.len();
        let unique = deduplicate(coerced);
        let duplicates_removed = coerced_rows - unique.len();

        let records = derive_daily_counts(unique);
        validate(&records)?;

        let counters = TransformCounters {
            input_rows,
            dropped_rows: dropped.len(),
            duplicates_removed,
            output_rows: records.len(),
        };
        tracing::info!(
            input_rows = counters.input_rows,
            dropped_rows = counters.dropped_rows,
            duplicates_removed = counters.duplicates_removed,
            output_rows = counters.output_rows,
            "transformed records"
        );

        Ok(TransformOutput {
            records,
            counters,
            dropped,
        })
    }

    /// Coerce the required fields of one row; on failure every invalid field
    /// is reported.
    pub fn coerce(&self, record: &RawRecord) -> Result<CoercedRow, DroppedRow> {
        let idx = self.role_indexes();
        let date = self.coerce_date(record, idx.date);
        let region = self.coerce_region(record, idx.region);
        let cases = self.coerce_count(record, idx.cases);
        let deaths = self.coerce_count(record, idx.deaths);

        match (date, region, cases, deaths) {
            (
                FieldValue::Valid(date),
                FieldValue::Valid(region),
                FieldValue::Valid(cases),
                FieldValue::Valid(deaths),
            ) => Ok(CoercedRow {
                line: record.line,
                date,
                region,
                cases,
                deaths,
            }),
            (date, region, cases, deaths) => {
                let failures = [
                    date.error().cloned(),
                    region.error().cloned(),
                    cases.error().cloned(),
                    deaths.error().cloned(),
                ]
                .into_iter()
                .flatten()
                .collect();
                Err(DroppedRow {
                    line: record.line,
                    failures,
                })
            }
        }
    }

    fn role_indexes(&self) -> RoleIndexes {
        let at = |role| self.schema.role_index(role).unwrap_or(0);
        RoleIndexes {
            date: at(ColumnRole::Date),
            region: at(ColumnRole::Region),
            cases: at(ColumnRole::CumulativeCases),
            deaths: at(ColumnRole::CumulativeDeaths),
        }
    }

    fn column_name(&self, index: usize) -> String {
        self.schema
            .columns()
            .get(index)
            .map(|c| c.name.clone())
            .unwrap_or_default()
    }

    fn invalid<T>(&self, index: usize, raw: &str, reason: impl Into<String>) -> FieldValue<T> {
        FieldValue::Invalid(FieldError {
            column: self.column_name(index),
            raw: raw.to_string(),
            reason: reason.into(),
        })
    }

    fn coerce_date(&self, record: &RawRecord, index: usize) -> FieldValue<NaiveDate> {
        let raw = record.field(index).unwrap_or_default();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return self.invalid(index, raw, "missing value");
        }
        for format in &self.options.date_formats {
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
                return FieldValue::Valid(date);
            }
        }
        self.invalid(
            index,
            raw,
            format!("not a date in {}", self.options.date_formats.join(" | ")),
        )
    }

    fn coerce_region(&self, record: &RawRecord, index: usize) -> FieldValue<String> {
        let raw = record.field(index).unwrap_or_default();
        let region = normalize_region(raw);
        if region.is_empty() {
            return self.invalid(index, raw, "missing value");
        }
        FieldValue::Valid(region)
    }

    fn coerce_count(&self, record: &RawRecord, index: usize) -> FieldValue<u64> {
        let raw = record.field(index).unwrap_or_default();
        match parse_count(raw) {
            Ok(value) => FieldValue::Valid(value),
            Err(reason) => self.invalid(index, raw, reason),
        }
    }
}

/// Trim, collapse inner whitespace and lowercase a region name.
pub fn normalize_region(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Parse a non-negative integer count. Integral decimals such as `12.0` are
/// accepted; the integer part is parsed exactly, so values beyond `u64` are
/// rejected rather than rounded.
pub fn parse_count(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("missing value".to_string());
    }
    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let whole = match unsigned.split_once('.') {
        Some((whole, fraction)) => {
            if !fraction.bytes().all(|b| b.is_ascii_digit()) {
                return Err("not a number".to_string());
            }
            if fraction.bytes().any(|b| b != b'0') {
                return Err("not a whole number".to_string());
            }
            whole
        }
        None => unsigned,
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err("not a number".to_string());
    }
    if negative && whole.bytes().any(|b| b != b'0') {
        return Err("negative count".to_string());
    }
    whole
        .parse::<u64>()
        .map_err(|_| "count out of range".to_string())
}

/// Keep the last-seen row for each `(region, date)` key.
fn deduplicate(rows: Vec<CoercedRow>) -> Vec<CoercedRow> {
    let mut latest: IndexMap<(String, NaiveDate), CoercedRow> = IndexMap::new();
    for row in rows {
        latest.insert((row.region.clone(), row.date), row);
    }
    latest.into_values().collect()
}

/// Group by region, sort by date and compute per-day deltas. The first date
/// of a region has no predecessor and gets zero.
fn derive_daily_counts(rows: Vec<CoercedRow>) -> Vec<CleanedRecord> {
    let mut by_region: BTreeMap<String, Vec<CoercedRow>> = BTreeMap::new();
    for row in rows {
        by_region.entry(row.region.clone()).or_default().push(row);
    }

    let mut records = Vec::new();
    for (_, mut series) in by_region {
        series.sort_by_key(|row| row.date);
        let mut previous: Option<(u64, u64)> = None;
        for row in series {
            let (new_cases, new_deaths) = match previous {
                Some((cases, deaths)) => (
                    row.cases.saturating_sub(cases),
                    row.deaths.saturating_sub(deaths),
                ),
                None => (0, 0),
            };
            previous = Some((row.cases, row.deaths));
            records.push(CleanedRecord {
                date: row.date,
                region: row.region,
                cases: row.cases,
                deaths: row.deaths,
                new_cases,
                new_deaths,
                source_line: row.line,
            });
        }
    }
    records
}

/// Records must be sorted by region then date.
fn validate(records: &[CleanedRecord]) -> Result<(), TransformationError> {
    for record in records {
        if record.region.is_empty() {
            return Err(TransformationError::MissingField {
                line: record.source_line,
                column: "region".to_string(),
            });
        }
    }
    for pair in records.windows(2) {
        let (prev, curr) = (&pair[0], &pair[1]);
        if prev.region != curr.region {
            continue;
        }
        if curr.cases < prev.cases {
            return Err(non_monotonic(curr, "cases", prev.cases, curr.cases));
        }
        if curr.deaths < prev.deaths {
            return Err(non_monotonic(curr, "deaths", prev.deaths, curr.deaths));
        }
    }
    Ok(())
}

fn non_monotonic(
    record: &CleanedRecord,
    column: &str,
    previous: u64,
    current: u64,
) -> TransformationError {
    TransformationError::NonMonotonic {
        region: record.region.clone(),
        date: record.date,
        column: column.to_string(),
        previous,
        current,
    }
}
