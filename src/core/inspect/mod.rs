//! Read-only profile of an extracted source, used to eyeball a file before
//! running the pipeline on it.

use crate::core::extract::Extraction;
use crate::core::transform::{DroppedRow, Transformer};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnBlanks {
    pub column: String,
    pub blanks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionRows {
    pub region: String,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateKey {
    pub region: String,
    pub date: NaiveDate,
    pub occurrences: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateSpan {
    pub first: NaiveDate,
    pub last: NaiveDate,
    pub distinct_dates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetProfile {
    pub source: String,
    pub sha256: String,
    pub rows: usize,
    pub columns: Vec<String>,
    pub blanks: Vec<ColumnBlanks>,
    pub regions: usize,
    pub top_regions: Vec<RegionRows>,
    pub date_span: Option<DateSpan>,
    /// Rows beyond the first for each repeated `(region, date)` key.
    pub duplicate_rows: usize,
    pub duplicate_keys: Vec<DuplicateKey>,
    pub coercion_failures: usize,
    pub failure_samples: Vec<DroppedRow>,
}

/// Profile `extraction`, using `transformer` for coercion. `top` bounds every
/// list in the result.
pub fn profile(extraction: &Extraction, transformer: &Transformer, top: usize) -> DatasetProfile {
    let columns = transformer.schema().column_names();
    let mut blanks = vec![0usize; columns.len()];
    let mut per_region: HashMap<String, usize> = HashMap::new();
    let mut per_key: HashMap<(String, NaiveDate), usize> = HashMap::new();
    let mut dates = BTreeSet::new();
    let mut failures = Vec::new();

    for record in &extraction.records {
        for (idx, field) in record.fields.iter().enumerate() {
            if field.trim().is_empty() {
                if let Some(count) = blanks.get_mut(idx) {
                    *count += 1;
                }
            }
        }
        match transformer.coerce(record) {
            Ok(row) => {
                *per_region.entry(row.region.clone()).or_default() += 1;
                *per_key.entry((row.region, row.date)).or_default() += 1;
                dates.insert(row.date);
            }
            Err(dropped) => failures.push(dropped),
        }
    }

    let mut top_regions: Vec<RegionRows> = per_region
        .iter()
        .map(|(region, rows)| RegionRows {
            region: region.clone(),
            rows: *rows,
        })
        .collect();
    top_regions.sort_by(|a, b| b.rows.cmp(&a.rows).then_with(|| a.region.cmp(&b.region)));
    top_regions.truncate(top);

    let duplicate_rows = per_key.values().filter(|n| **n > 1).map(|n| n - 1).sum();
    let mut duplicate_keys: Vec<DuplicateKey> = per_key
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|((region, date), occurrences)| DuplicateKey {
            region,
            date,
            occurrences,
        })
        .collect();
    duplicate_keys.sort_by(|a, b| {
        b.occurrences
            .cmp(&a.occurrences)
            .then_with(|| a.region.cmp(&b.region))
            .then_with(|| a.date.cmp(&b.date))
    });
    duplicate_keys.truncate(top);

    let date_span = match (dates.first(), dates.last()) {
        (Some(first), Some(last)) => Some(DateSpan {
            first: *first,
            last: *last,
            distinct_dates: dates.len(),
        }),
        _ => None,
    };

    let coercion_failures = failures.len();
    failures.truncate(top);

    DatasetProfile {
        source: extraction.source.clone(),
        sha256: extraction.source_sha256.clone(),
        rows: extraction.records.len(),
        blanks: columns
            .iter()
            .zip(blanks)
            .map(|(column, blanks)| ColumnBlanks {
                column: column.clone(),
                blanks,
            })
            .collect(),
        columns,
        regions: per_region.len(),
        top_regions,
        date_span,
        duplicate_rows,
        duplicate_keys,
        coercion_failures,
        failure_samples: failures,
    }
}

pub fn render_text(profile: &DatasetProfile) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Source: {}", profile.source);
    let _ = writeln!(out, "SHA-256: {}", profile.sha256);
    let _ = writeln!(out, "Rows: {}", profile.rows);
    let _ = writeln!(out, "Columns: {}", profile.columns.join(", "));
    let _ = writeln!(out, "\nBlank values per column:");
    for entry in &profile.blanks {
        let _ = writeln!(out, "  {:<16} {}", entry.column, entry.blanks);
    }
    match &profile.date_span {
        Some(span) => {
            let _ = writeln!(
                out,
                "\nDates: {} .. {} ({} distinct)",
                span.first, span.last, span.distinct_dates
            );
        }
        None => {
            let _ = writeln!(out, "\nDates: none parsed");
        }
    }
    let _ = writeln!(out, "\nRegions: {}", profile.regions);
    for region in &profile.top_regions {
        let _ = writeln!(out, "  {:<24} {}", region.region, region.rows);
    }
    let _ = writeln!(out, "\nDuplicate (region, date) rows: {}", profile.duplicate_rows);
    for key in &profile.duplicate_keys {
        let _ = writeln!(out, "  {} {} x{}", key.region, key.date, key.occurrences);
    }
    let _ = writeln!(out, "\nRows failing coercion: {}", profile.coercion_failures);
    for row in &profile.failure_samples {
        let failures: Vec<String> = row.failures.iter().map(|f| f.to_string()).collect();
        let _ = writeln!(out, "  line {}: {}", row.line, failures.join("; "));
    }
    out
}
