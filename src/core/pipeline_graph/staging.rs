#![allow(clippy::result_large_err)]

//! File hand-off between stages when the orchestrator runs each stage as a
//! separate process.

use crate::core::error::AppError;
use crate::core::extract::Extraction;
use crate::core::pipeline_graph::history::atomic_write;
use crate::core::pipeline_graph::schema::StageId;
use crate::core::transform::TransformOutput;
use crate::core::types::ErrorCategory;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

const EXTRACTED_FILE: &str = "extracted.json";
const TRANSFORMED_FILE: &str = "transformed.json";

/// Staging directory of one logical date: `<state_dir>/staging/<date>/`.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(state_dir: &Path, logical_date: NaiveDate) -> Self {
        Self {
            dir: state_dir
                .join("staging")
                .join(logical_date.format("%Y-%m-%d").to_string()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn extracted_path(&self) -> PathBuf {
        self.dir.join(EXTRACTED_FILE)
    }

    pub fn transformed_path(&self) -> PathBuf {
        self.dir.join(TRANSFORMED_FILE)
    }

    pub fn write_extraction(&self, extraction: &Extraction) -> Result<PathBuf, AppError> {
        let path = self.extracted_path();
        write_json(&path, extraction)?;
        Ok(path)
    }

    pub fn read_extraction(&self) -> Result<Extraction, AppError> {
        read_json(&self.extracted_path(), StageId::Extract)
    }

    pub fn write_transform(&self, output: &TransformOutput) -> Result<PathBuf, AppError> {
        let path = self.transformed_path();
        write_json(&path, output)?;
        Ok(path)
    }

    pub fn read_transform(&self) -> Result<TransformOutput, AppError> {
        read_json(&self.transformed_path(), StageId::Transform)
    }

    /// Remove the staging directory. Returns whether anything was removed;
    /// an absent directory is not an error.
    pub fn cleanup(&self) -> Result<bool, AppError> {
        if !self.dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&self.dir).map_err(|err| {
            AppError::new(
                ErrorCategory::IoError,
                format!("failed to remove {}: {}", self.dir.display(), err),
            )
            .with_code("PIPE-STAGE-003")
        })?;
        Ok(true)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AppError> {
    let content = serde_json::to_vec(value).map_err(|err| {
        AppError::new(
            ErrorCategory::SerializationError,
            format!("failed to serialize {}: {}", path.display(), err),
        )
    })?;
    atomic_write(path, &content)
}

fn read_json<T: DeserializeOwned>(path: &Path, producer: StageId) -> Result<T, AppError> {
    if !path.exists() {
        return Err(AppError::new(
            ErrorCategory::ValidationError,
            format!(
                "missing {} artifact {}; run `task {}` for this date first",
                producer,
                path.display(),
                producer
            ),
        )
        .with_code("PIPE-STAGE-002")
        .with_context("artifact", path.display().to_string()));
    }
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
        .with_code("PIPE-STAGE-004")
    })
}
