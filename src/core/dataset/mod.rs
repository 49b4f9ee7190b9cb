#![allow(clippy::result_large_err)]

//! Record types shared by every pipeline stage.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Value type a source column is coerced into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Date,
    Text,
    Count,
}

/// Meaning of a column for the pipeline. Columns without a role are carried
/// through extraction and ignored afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    Date,
    Region,
    CumulativeCases,
    CumulativeDeaths,
}

impl ColumnRole {
    pub const ALL: [ColumnRole; 4] = [
        ColumnRole::Date,
        ColumnRole::Region,
        ColumnRole::CumulativeCases,
        ColumnRole::CumulativeDeaths,
    ];

    /// Kind a column must have to fill this role.
    pub fn required_kind(&self) -> ColumnKind {
        match self {
            ColumnRole::Date => ColumnKind::Date,
            ColumnRole::Region => ColumnKind::Text,
            ColumnRole::CumulativeCases | ColumnRole::CumulativeDeaths => ColumnKind::Count,
        }
    }
}

impl fmt::Display for ColumnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnRole::Date => "date",
            ColumnRole::Region => "region",
            ColumnRole::CumulativeCases => "cumulative_cases",
            ColumnRole::CumulativeDeaths => "cumulative_deaths",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ColumnRole>,
}

impl ColumnSpec {
    pub fn new(name: &str, kind: ColumnKind, role: Option<ColumnRole>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            role,
        }
    }
}

/// Ordered column list of the raw source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSchema {
    columns: Vec<ColumnSpec>,
}

impl Default for SourceSchema {
    /// NYT "us-states" layout.
    fn default() -> Self {
        Self {
            columns: vec![
                ColumnSpec::new("date", ColumnKind::Date, Some(ColumnRole::Date)),
                ColumnSpec::new("state", ColumnKind::Text, Some(ColumnRole::Region)),
                ColumnSpec::new("fips", ColumnKind::Text, None),
                ColumnSpec::new("cases", ColumnKind::Count, Some(ColumnRole::CumulativeCases)),
                ColumnSpec::new(
                    "deaths",
                    ColumnKind::Count,
                    Some(ColumnRole::CumulativeDeaths),
                ),
            ],
        }
    }
}

impl SourceSchema {
    /// Build a schema and check that every role is filled exactly once by a
    /// column of the matching kind.
    pub fn new(columns: Vec<ColumnSpec>) -> Result<Self, AppError> {
        let schema = Self { columns };
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.columns.is_empty() {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "source schema must declare at least one column",
            )
            .with_code("CFG-SCHEMA-001"));
        }
        let mut names = HashSet::new();
        for column in &self.columns {
            let name = column.name.trim();
            if name.is_empty() {
                return Err(AppError::new(
                    ErrorCategory::ValidationError,
                    "source schema column names cannot be empty",
                )
                .with_code("CFG-SCHEMA-001"));
            }
            if !names.insert(name.to_string()) {
                return Err(AppError::new(
                    ErrorCategory::ValidationError,
                    format!("duplicate source column: {}", name),
                )
                .with_code("CFG-SCHEMA-002"));
            }
        }
        for role in ColumnRole::ALL {
            let holders: Vec<&ColumnSpec> = self
                .columns
                .iter()
                .filter(|c| c.role == Some(role))
                .collect();
            match holders.as_slice() {
                [column] => {
                    if column.kind != role.required_kind() {
                        return Err(AppError::new(
                            ErrorCategory::ValidationError,
                            format!(
                                "column '{}' has kind {:?} but role {} requires {:?}",
                                column.name,
                                column.kind,
                                role,
                                role.required_kind()
                            ),
                        )
                        .with_code("CFG-SCHEMA-003"));
                    }
                }
                [] => {
                    return Err(AppError::new(
                        ErrorCategory::ValidationError,
                        format!("no source column carries the {} role", role),
                    )
                    .with_code("CFG-SCHEMA-004"));
                }
                _ => {
                    return Err(AppError::new(
                        ErrorCategory::ValidationError,
                        format!("more than one source column carries the {} role", role),
                    )
                    .with_code("CFG-SCHEMA-004"));
                }
            }
        }
        Ok(())
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Index of the column holding `role`. Validated schemas always have one.
    pub fn role_index(&self, role: ColumnRole) -> Option<usize> {
        self.columns.iter().position(|c| c.role == Some(role))
    }

    pub fn role_column(&self, role: ColumnRole) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.role == Some(role))
    }
}

/// One untyped source row. `fields` follow the schema's column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub line: u64,
    pub fields: Vec<String>,
}

impl RawRecord {
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }
}

/// Why a single field failed coercion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub column: String,
    pub raw: String,
    pub reason: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}='{}': {}", self.column, self.raw, self.reason)
    }
}

/// Per-field coercion result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue<T> {
    Valid(T),
    Invalid(FieldError),
}

impl<T> FieldValue<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            FieldValue::Valid(value) => Some(value),
            FieldValue::Invalid(_) => None,
        }
    }

    pub fn error(&self) -> Option<&FieldError> {
        match self {
            FieldValue::Valid(_) => None,
            FieldValue::Invalid(err) => Some(err),
        }
    }
}

/// Typed row produced by the transform stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanedRecord {
    pub date: NaiveDate,
    pub region: String,
    pub cases: u64,
    pub deaths: u64,
    pub new_cases: u64,
    pub new_deaths: u64,
    pub source_line: u64,
}

/// Inclusive date range a run is allowed to overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunScope {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl RunScope {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for RunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..={}", self.start, self.end)
        }
    }
}

/// Records persisted by one load, tagged with the run's logical date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBatch {
    pub logical_date: NaiveDate,
    pub records: Vec<CleanedRecord>,
}

impl LoadBatch {
    pub fn new(logical_date: NaiveDate, records: Vec<CleanedRecord>) -> Self {
        Self {
            logical_date,
            records,
        }
    }

    /// Date range covered by the batch records, `None` when empty.
    pub fn scope(&self) -> Option<RunScope> {
        let start = self.records.iter().map(|r| r.date).min()?;
        let end = self.records.iter().map(|r| r.date).max()?;
        Some(RunScope::new(start, end))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
