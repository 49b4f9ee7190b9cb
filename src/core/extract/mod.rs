//! Extraction of the raw delimited source into untyped records.
//!
//! Extraction is all-or-nothing: the source is read completely, its header is
//! matched against the configured [`SourceSchema`], and every data row is
//! re-aligned to schema order. Any failure discards all rows read so far.

use crate::core::dataset::{RawRecord, SourceSchema};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::pipeline_graph::state::compute_sha256_hex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const UTF8_BOM: char = '\u{feff}';

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("source file not found: {}", path.display())]
    SourceMissing { path: PathBuf },

    #[error("source {source_name} is unreadable: {reason}")]
    Unreadable { source_name: String, reason: String },

    #[error("source {source_name} contains no data rows")]
    Empty { source_name: String },

    #[error(
        "source header does not match the schema \
         (missing: {missing:?}, unexpected: {unexpected:?})"
    )]
    SchemaMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("row at line {line} has {found} fields, header has {expected}")]
    MalformedRow {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("reading source exceeded the {}s timeout", timeout.as_secs_f64())]
    Timeout { timeout: Duration },
}

impl ExtractionError {
    /// Only a timed out read is worth retrying; every other failure is about
    /// the shape or presence of the file.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExtractionError::Timeout { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            ExtractionError::SourceMissing { .. } => "EXT-SRC-001",
            ExtractionError::Unreadable { .. } => "EXT-SRC-002",
            ExtractionError::Empty { .. } => "EXT-SRC-003",
            ExtractionError::SchemaMismatch { .. } => "EXT-SHAPE-001",
            ExtractionError::MalformedRow { .. } => "EXT-SHAPE-002",
            ExtractionError::Timeout { .. } => "EXT-TIME-001",
        }
    }
}

impl From<ExtractionError> for AppError {
    fn from(err: ExtractionError) -> Self {
        let category = match err {
            ExtractionError::Timeout { .. } => ErrorCategory::TimeoutError,
            _ => ErrorCategory::ExtractionError,
        };
        let mut app = AppError::new(category, err.to_string()).with_code(err.code());
        match &err {
            ExtractionError::SourceMissing { path } => {
                app.add_context("path", &path.display().to_string());
            }
            ExtractionError::MalformedRow { line, .. } => {
                app.add_context("line", &line.to_string());
            }
            ExtractionError::SchemaMismatch {
                missing,
                unexpected,
            } => {
                app.add_context("missing", &missing.join(","));
                app.add_context("unexpected", &unexpected.join(","));
            }
            _ => {}
        }
        if err.is_transient() {
            app = app.transient();
        }
        app
    }
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub delimiter: u8,
    pub io_timeout: Duration,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            io_timeout: Duration::from_secs(30),
        }
    }
}

/// Rows read from one source, aligned to schema order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    pub records: Vec<RawRecord>,
    /// Header as it appeared in the source, after trimming.
    pub headers: Vec<String>,
    pub source_sha256: String,
    pub source: String,
}

impl Extraction {
    pub fn row_count(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug, Clone)]
pub struct Extractor {
    schema: SourceSchema,
    options: ExtractOptions,
}

impl Extractor {
    pub fn new(schema: SourceSchema, options: ExtractOptions) -> Self {
        Self { schema, options }
    }

    pub fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    /// Read and parse the file at `path` on a blocking thread, bounded by the
    /// configured I/O timeout.
    pub async fn extract_path(&self, path: &Path) -> Result<Extraction, ExtractionError> {
        let extractor = self.clone();
        let owned = path.to_path_buf();
        let timeout = self.options.io_timeout;
        let task = tokio::task::spawn_blocking(move || extractor.extract_path_blocking(&owned));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ExtractionError::Unreadable {
                source_name: path.display().to_string(),
                reason: format!("extraction worker failed: {}", join_err),
            }),
            Err(_) => {
                tracing::warn!(source = %path.display(), ?timeout, "source read timed out");
                Err(ExtractionError::Timeout { timeout })
            }
        }
    }

    /// Synchronous variant of [`Extractor::extract_path`] without the timeout.
    pub fn extract_path_blocking(&self, path: &Path) -> Result<Extraction, ExtractionError> {
        if !path.exists() {
            return Err(ExtractionError::SourceMissing {
                path: path.to_path_buf(),
            });
        }
        let bytes = std::fs::read(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => ExtractionError::SourceMissing {
                path: path.to_path_buf(),
            },
            _ => ExtractionError::Unreadable {
                source_name: path.display().to_string(),
                reason: err.to_string(),
            },
        })?;
        self.parse_bytes(&bytes, &path.display().to_string())
    }

    /// Parse an arbitrary byte source. `source_name` labels it in errors and
    /// in the returned [`Extraction`].
    pub fn extract_reader<R: Read>(
        &self,
        mut reader: R,
        source_name: &str,
    ) -> Result<Extraction, ExtractionError> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|err| ExtractionError::Unreadable {
                source_name: source_name.to_string(),
                reason: err.to_string(),
            })?;
        self.parse_bytes(&bytes, source_name)
    }

    fn parse_bytes(&self, bytes: &[u8], source_name: &str) -> Result<Extraction, ExtractionError> {
        let source_sha256 = compute_sha256_hex(bytes);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.options.delimiter)
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(bytes);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|err| unreadable(source_name, err))?
            .iter()
            .map(normalize_header)
            .collect();
        if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
            return Err(ExtractionError::Empty {
                source_name: source_name.to_string(),
            });
        }

        let alignment = self.align_headers(&headers)?;

        let mut records = Vec::new();
        for result in reader.records() {
            let record = result.map_err(|err| unreadable(source_name, err))?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            if record.len() == 1 && record.get(0).map(str::is_empty).unwrap_or(true) {
                continue;
            }
            if record.len() != headers.len() {
                return Err(ExtractionError::MalformedRow {
                    line,
                    expected: headers.len(),
                    found: record.len(),
                });
            }
            let fields = alignment
                .iter()
                .map(|&idx| record.get(idx).unwrap_or_default().to_string())
                .collect();
            records.push(RawRecord { line, fields });
        }

        if records.is_empty() {
            return Err(ExtractionError::Empty {
                source_name: source_name.to_string(),
            });
        }

        tracing::info!(
            source = source_name,
            rows = records.len(),
            sha256 = %source_sha256,
            "extracted source rows"
        );

        Ok(Extraction {
            records,
            headers,
            source_sha256,
            source: source_name.to_string(),
        })
    }

    /// Map each schema column to its index in the source header.
    fn align_headers(&self, headers: &[String]) -> Result<Vec<usize>, ExtractionError> {
        let mut positions: HashMap<&str, usize> = HashMap::new();
        let mut duplicated = BTreeSet::new();
        for (idx, name) in headers.iter().enumerate() {
            if positions.insert(name.as_str(), idx).is_some() {
                duplicated.insert(name.clone());
            }
        }

        let expected: BTreeSet<&str> = self
            .schema
            .columns()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        let missing: Vec<String> = expected
            .iter()
            .filter(|name| !positions.contains_key(*name))
            .map(|name| name.to_string())
            .collect();
        let mut unexpected: Vec<String> = headers
            .iter()
            .filter(|name| !expected.contains(name.as_str()))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        unexpected.extend(duplicated);

        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(ExtractionError::SchemaMismatch {
                missing,
                unexpected,
            });
        }

        Ok(self
            .schema
            .columns()
            .iter()
            .filter_map(|c| positions.get(c.name.as_str()).copied())
            .collect())
    }
}

fn normalize_header(name: &str) -> String {
    name.trim().trim_start_matches(UTF8_BOM).trim().to_string()
}

fn unreadable(source_name: &str, err: csv::Error) -> ExtractionError {
    ExtractionError::Unreadable {
        source_name: source_name.to_string(),
        reason: err.to_string(),
    }
}
