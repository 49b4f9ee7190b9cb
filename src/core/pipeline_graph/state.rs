#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::pipeline_graph::schema::StageId;
use crate::core::types::ErrorCategory;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Version embedded in persisted run records.
pub const RUN_RECORD_FORMAT_VERSION: &str = "1";

/// Exit code for a failure the orchestrator may retry (EX_TEMPFAIL).
pub const EXIT_TRANSIENT: i32 = 75;
pub const EXIT_CANCELLED: i32 = 130;

/// Lifecycle state of a stage within one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    #[default]
    Pending,
    Running,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
    UpstreamFailed,
    Cancelled,
}

impl StageState {
    pub fn can_transition_to(self, next: StageState) -> bool {
        use StageState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, UpstreamFailed)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, FailedRetryable)
                | (Running, FailedTerminal)
                | (Running, Cancelled)
                | (FailedRetryable, Pending)
                | (FailedRetryable, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageState::Succeeded
                | StageState::FailedTerminal
                | StageState::UpstreamFailed
                | StageState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Succeeded => "succeeded",
            StageState::FailedRetryable => "failed_retryable",
            StageState::FailedTerminal => "failed_terminal",
            StageState::UpstreamFailed => "upstream_failed",
            StageState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall outcome of a run or single task invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    #[default]
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "Running",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Simplified summary of errors persisted to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppErrorSummary {
    pub code: String,
    pub category: String,
    pub message: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

/// Create a persisted summary of an AppError.
pub fn summarize_error(error: &AppError) -> AppErrorSummary {
    AppErrorSummary {
        code: error.code.clone(),
        category: format!("{:?}", error.category),
        message: error.message.clone(),
        severity: error.severity.to_string(),
        retryable: error.retryable,
        context: error.context.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: StageState,
    pub to: StageState,
    pub at: DateTime<Utc>,
}

/// Per-stage record kept in the run record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageId,
    pub state: StageState,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transitions: Vec<StateTransition>,
    /// Failure of every unsuccessful attempt, oldest first.
    #[serde(default)]
    pub attempt_errors: Vec<AppErrorSummary>,
}

impl StageRecord {
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            state: StageState::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            transitions: Vec::new(),
            attempt_errors: Vec::new(),
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: StageState) -> Result<(), AppError> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::new(
                ErrorCategory::InternalError,
                format!(
                    "illegal transition for stage {}: {} -> {}",
                    self.stage, self.state, next
                ),
            )
            .with_code("PIPE-STATE-001"));
        }
        let now = Utc::now();
        if next == StageState::Running {
            self.attempts += 1;
            if self.started_at.is_none() {
                self.started_at = Some(now);
            }
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.transitions.push(StateTransition {
            from: self.state,
            to: next,
            at: now,
        });
        self.state = next;
        Ok(())
    }

    pub fn last_error(&self) -> Option<&AppErrorSummary> {
        self.attempt_errors.last()
    }
}

/// Row counters surfaced for every run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub rows_extracted: u64,
    pub rows_dropped: u64,
    pub rows_deduplicated: u64,
    pub rows_loaded: u64,
    pub rows_deleted: u64,
}

/// What kind of invocation produced a run record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "task", rename_all = "snake_case")]
pub enum RunKind {
    Pipeline,
    Task(String),
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Pipeline => f.write_str("run"),
            RunKind::Task(task) => write!(f, "task:{}", task),
        }
    }
}

/// Run metadata persisted under `<state_dir>/runs/<run_id>/run.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub format_version: String,
    pub run_id: Uuid,
    pub kind: RunKind,
    pub logical_date: NaiveDate,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageRecord>,
    pub counters: RunCounters,
    pub source_sha256: Option<String>,
}

impl RunRecord {
    pub fn new(kind: RunKind, logical_date: NaiveDate, stages: &[StageId]) -> Self {
        Self {
            format_version: RUN_RECORD_FORMAT_VERSION.to_string(),
            run_id: Uuid::new_v4(),
            kind,
            logical_date,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            stages: stages.iter().map(|id| StageRecord::new(*id)).collect(),
            counters: RunCounters::default(),
            source_sha256: None,
        }
    }

    pub fn stage(&self, id: StageId) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.stage == id)
    }

    pub fn stage_mut(&mut self, id: StageId) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|s| s.stage == id)
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// First stage that ended in a terminal failure.
    pub fn failed_stage(&self) -> Option<&StageRecord> {
        self.stages
            .iter()
            .find(|s| s.state == StageState::FailedTerminal)
    }

    /// Process exit code for this record. A failure whose last error was
    /// transient maps to 75 so the orchestrator can retry the task.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::Cancelled => EXIT_CANCELLED,
            RunStatus::Running => 1,
            RunStatus::Failed => {
                let transient = self
                    .failed_stage()
                    .and_then(|s| s.last_error())
                    .map(|e| e.retryable)
                    .unwrap_or(false);
                if transient {
                    EXIT_TRANSIENT
                } else {
                    1
                }
            }
        }
    }
}

/// Compute the SHA-256 hash encoded as lowercase hex.
pub fn compute_sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
