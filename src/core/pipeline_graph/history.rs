#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::pipeline_graph::state::RunRecord;
use crate::core::types::ErrorCategory;
use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Paths under `<state_dir>/runs/<run_id>`.
pub struct RunStatePaths {
    pub run_dir: PathBuf,
    pub run_file: PathBuf,
}

impl RunStatePaths {
    pub fn new(state_dir: &Path, run_id: &Uuid) -> Self {
        let run_dir = Self::runs_root(state_dir).join(run_id.to_string());
        let run_file = run_dir.join("run.json");
        Self { run_dir, run_file }
    }

    pub fn runs_root(state_dir: &Path) -> PathBuf {
        state_dir.join("runs")
    }
}

/// Write `data` to a sibling temp file and rename it over `path`.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            AppError::new(
                ErrorCategory::IoError,
                format!("failed to create directory {}: {}", parent.display(), err),
            )
        })?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data).map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!("failed to write {}: {}", tmp_path.display(), err),
        )
    })?;
    fs::rename(&tmp_path, path).map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!(
                "failed to rename {} -> {}: {}",
                tmp_path.display(),
                path.display(),
                err
            ),
        )
    })?;
    Ok(())
}

pub fn save_run(state_dir: &Path, record: &RunRecord) -> Result<(), AppError> {
    let paths = RunStatePaths::new(state_dir, &record.run_id);
    let content = serde_json::to_vec_pretty(record).map_err(|err| {
        AppError::new(
            ErrorCategory::SerializationError,
            format!("failed to serialize run.json: {}", err),
        )
    })?;
    atomic_write(&paths.run_file, &content)
}

pub fn load_run(state_dir: &Path, run_id: &Uuid) -> Result<RunRecord, AppError> {
    let paths = RunStatePaths::new(state_dir, run_id);
    if !paths.run_file.exists() {
        return Err(AppError::new(
            ErrorCategory::ValidationError,
            format!("no run with id {}", run_id),
        )
        .with_code("PIPE-HIST-001"));
    }
    read_record(&paths.run_file)
}

fn read_record(path: &Path) -> Result<RunRecord, AppError> {
    let bytes = fs::read(path).map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!("failed to read {}: {}", path.display(), err),
        )
    })?;
    serde_json::from_slice(&bytes).map_err(|err| {
        AppError::new(
            ErrorCategory::SerializationError,
            format!("failed to deserialize {}: {}", path.display(), err),
        )
    })
}

/// Persisted runs, newest first, optionally restricted to one logical date.
/// Unreadable entries are skipped with a warning.
pub fn list_runs(
    state_dir: &Path,
    logical_date: Option<NaiveDate>,
    limit: Option<usize>,
) -> Result<Vec<RunRecord>, AppError> {
    let root = RunStatePaths::runs_root(state_dir);
    if !root.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(&root).map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!("failed to list {}: {}", root.display(), err),
        )
    })?;

    let mut records = Vec::new();
    for entry in entries.flatten() {
        let run_file = entry.path().join("run.json");
        if !run_file.is_file() {
            continue;
        }
        match read_record(&run_file) {
            Ok(record) => {
                if logical_date.map_or(true, |d| record.logical_date == d) {
                    records.push(record);
                }
            }
            Err(err) => {
                tracing::warn!(
                    path = %run_file.display(),
                    error = %err,
                    "skipping unreadable run record"
                );
            }
        }
    }
    records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    if let Some(limit) = limit {
        records.truncate(limit);
    }
    Ok(records)
}
