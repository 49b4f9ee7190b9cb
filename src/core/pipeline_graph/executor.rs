#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::pipeline_graph::history::save_run;
use crate::core::pipeline_graph::operator::{Stage, StageContext, StageData, StageRegistry};
use crate::core::pipeline_graph::schema::{PipelineGraph, RetryPolicy, StageId, StageSpec};
use crate::core::pipeline_graph::staging::StagingArea;
use crate::core::pipeline_graph::state::{
    summarize_error, RunKind, RunRecord, RunStatus, StageRecord, StageState,
};
use crate::core::types::ErrorCategory;
use chrono::NaiveDate;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Inputs shared by full runs and single-task invocations.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub logical_date: NaiveDate,
    pub state_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn new(logical_date: NaiveDate, state_dir: PathBuf) -> Self {
        Self {
            logical_date,
            state_dir,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

enum StageOutcome {
    Succeeded(StageData),
    Failed(AppError),
    Cancelled,
}

enum AttemptResult {
    Done(Result<StageData, AppError>),
    Cancelled,
}

/// Execute the whole graph in topological order with in-memory hand-off.
///
/// The returned record carries the final status; `Err` is reserved for
/// failures of the executor itself, such as an unregistered stage or an
/// unwritable state directory.
pub async fn execute_run(
    graph: &PipelineGraph,
    registry: &StageRegistry,
    options: &RunOptions,
) -> Result<RunRecord, AppError> {
    let stages = resolve_stages(graph, registry, graph.order())?;
    let mut record = RunRecord::new(RunKind::Pipeline, options.logical_date, graph.order());
    let run_id = record.run_id;
    save_run(&options.state_dir, &record)?;

    let span = tracing::info_span!(
        "run",
        run_id = %run_id,
        logical_date = %options.logical_date
    );
    async {
        tracing::info!("pipeline run started");
        let mut data = StageData::Empty;
        let mut status = RunStatus::Succeeded;

        for (spec, stage) in &stages {
            if options.cancel.is_cancelled() {
                status = RunStatus::Cancelled;
                break;
            }
            let outcome = run_stage(
                spec,
                stage.as_ref(),
                &data,
                stage_record_mut(&mut record, spec.id)?,
                run_id,
                options,
            )
            .await?;
            match outcome {
                StageOutcome::Succeeded(output) => {
                    apply_counters(&mut record, &output);
                    data = output;
                }
                StageOutcome::Failed(err) => {
                    tracing::error!(
                        stage = %spec.id,
                        code = %err.code,
                        "stage failed, aborting run"
                    );
                    for downstream in graph.downstream_of(spec.id) {
                        stage_record_mut(&mut record, downstream)?
                            .transition(StageState::UpstreamFailed)?;
                    }
                    status = RunStatus::Failed;
                }
                StageOutcome::Cancelled => status = RunStatus::Cancelled,
            }
            save_run(&options.state_dir, &record)?;
            if status != RunStatus::Succeeded {
                break;
            }
        }

        if status == RunStatus::Cancelled {
            cancel_pending(&mut record)?;
        }
        record.finish(status);
        save_run(&options.state_dir, &record)?;
        tracing::info!(
            status = %record.status,
            rows_extracted = record.counters.rows_extracted,
            rows_dropped = record.counters.rows_dropped,
            rows_deduplicated = record.counters.rows_deduplicated,
            rows_loaded = record.counters.rows_loaded,
            rows_deleted = record.counters.rows_deleted,
            "pipeline run finished"
        );
        Ok(record)
    }
    .instrument(span)
    .await
}

/// Execute one stage as a single attempt, reading its input from and writing
/// its output to the staging area of the logical date. Retrying is left to
/// the orchestrator, which sees transient failures through the exit code.
pub async fn execute_task(
    graph: &PipelineGraph,
    registry: &StageRegistry,
    stage_id: StageId,
    options: &RunOptions,
) -> Result<RunRecord, AppError> {
    let (spec, stage) = resolve_stages(graph, registry, &[stage_id])?
        .into_iter()
        .next()
        .ok_or_else(|| unknown_stage(stage_id))?;
    let single = StageSpec {
        retry: RetryPolicy::none(),
        ..spec
    };
    let staging = StagingArea::new(&options.state_dir, options.logical_date);
    let mut record = RunRecord::new(
        RunKind::Task(stage_id.to_string()),
        options.logical_date,
        &[stage_id],
    );
    let run_id = record.run_id;
    save_run(&options.state_dir, &record)?;

    let span = tracing::info_span!(
        "task",
        run_id = %run_id,
        logical_date = %options.logical_date,
        stage = %stage_id
    );
    async {
        let input = match stage_id {
            StageId::Extract => Ok(StageData::Empty),
            StageId::Transform => staging.read_extraction().map(StageData::Extracted),
            StageId::Load => staging.read_transform().map(StageData::Transformed),
        };
        let input = match input {
            Ok(input) => input,
            Err(err) => {
                tracing::error!(
                    code = %err.code,
                    error = %err.message,
                    "upstream artifact unavailable"
                );
                let stage_record = stage_record_mut(&mut record, stage_id)?;
                stage_record.attempt_errors.push(summarize_error(&err));
                stage_record.transition(StageState::UpstreamFailed)?;
                record.finish(RunStatus::Failed);
                save_run(&options.state_dir, &record)?;
                return Ok(record);
            }
        };

        let outcome = run_stage(
            &single,
            stage.as_ref(),
            &input,
            stage_record_mut(&mut record, stage_id)?,
            run_id,
            options,
        )
        .await?;

        let status = match outcome {
            StageOutcome::Succeeded(output) => {
                apply_counters(&mut record, &output);
                let staged = match &output {
                    StageData::Extracted(extraction) => {
                        Some(staging.write_extraction(extraction))
                    }
                    StageData::Transformed(transformed) => {
                        Some(staging.write_transform(transformed))
                    }
                    StageData::Loaded(_) | StageData::Empty => None,
                };
                match staged {
                    Some(Err(err)) => {
                        record.finish(RunStatus::Failed);
                        save_run(&options.state_dir, &record)?;
                        return Err(err);
                    }
                    Some(Ok(path)) => {
                        tracing::info!(artifact = %path.display(), "staged stage output");
                    }
                    None => {}
                }
                RunStatus::Succeeded
            }
            StageOutcome::Failed(_) => RunStatus::Failed,
            StageOutcome::Cancelled => RunStatus::Cancelled,
        };
        record.finish(status);
        save_run(&options.state_dir, &record)?;
        tracing::info!(status = %record.status, "task finished");
        Ok(record)
    }
    .instrument(span)
    .await
}

/// Remove the staging area of the logical date. Safe to run whatever the
/// state of the other tasks.
pub fn execute_cleanup(options: &RunOptions) -> Result<RunRecord, AppError> {
    let staging = StagingArea::new(&options.state_dir, options.logical_date);
    let mut record = RunRecord::new(
        RunKind::Task("cleanup".to_string()),
        options.logical_date,
        &[],
    );
    match staging.cleanup() {
        Ok(removed) => {
            tracing::info!(
                run_id = %record.run_id,
                staging = %staging.dir().display(),
                removed,
                "staging cleanup finished"
            );
            record.finish(RunStatus::Succeeded);
            save_run(&options.state_dir, &record)?;
            Ok(record)
        }
        Err(err) => {
            record.finish(RunStatus::Failed);
            save_run(&options.state_dir, &record)?;
            Err(err)
        }
    }
}

fn resolve_stages(
    graph: &PipelineGraph,
    registry: &StageRegistry,
    ids: &[StageId],
) -> Result<Vec<(StageSpec, Arc<dyn Stage>)>, AppError> {
    ids.iter()
        .map(|id| {
            let spec = graph.stage(*id).cloned().ok_or_else(|| unknown_stage(*id))?;
            let stage = registry.get(*id).ok_or_else(|| {
                AppError::new(
                    ErrorCategory::ValidationError,
                    format!("stage '{}' is not registered", id),
                )
                .with_code("PIPE-OP-001")
            })?;
            Ok((spec, stage))
        })
        .collect()
}

fn unknown_stage(id: StageId) -> AppError {
    AppError::new(
        ErrorCategory::ValidationError,
        format!("stage '{}' is not part of the pipeline graph", id),
    )
    .with_code("PIPE-GRAPH-002")
}

fn stage_record_mut(record: &mut RunRecord, id: StageId) -> Result<&mut StageRecord, AppError> {
    record.stage_mut(id).ok_or_else(|| {
        AppError::new(
            ErrorCategory::InternalError,
            format!("run record has no entry for stage {}", id),
        )
        .with_code("PIPE-STATE-002")
    })
}

fn cancel_pending(record: &mut RunRecord) -> Result<(), AppError> {
    for stage_record in record.stages.iter_mut() {
        if stage_record.state == StageState::Pending {
            stage_record.transition(StageState::Cancelled)?;
        }
    }
    Ok(())
}

/// Drive one stage through its attempts until it succeeds, fails terminally,
/// exhausts its retry budget or is cancelled.
async fn run_stage(
    spec: &StageSpec,
    stage: &dyn Stage,
    input: &StageData,
    record: &mut StageRecord,
    run_id: Uuid,
    options: &RunOptions,
) -> Result<StageOutcome, AppError> {
    let max_attempts = spec.retry.max_attempts();
    loop {
        record.transition(StageState::Running)?;
        let attempt = record.attempts;
        let ctx = StageContext {
            run_id,
            logical_date: options.logical_date,
            stage: spec.id,
            attempt,
        };
        let span = tracing::info_span!(
            "stage",
            run_id = %run_id,
            logical_date = %options.logical_date,
            stage = %spec.id,
            attempt
        );
        let result = run_attempt(stage, input, &ctx, spec.timeout, &options.cancel)
            .instrument(span)
            .await;

        let err = match result {
            AttemptResult::Cancelled => {
                tracing::warn!(stage = %spec.id, attempt, "stage cancelled");
                record.attempt_errors.push(summarize_error(&cancelled(spec.id, attempt)));
                record.transition(StageState::Cancelled)?;
                return Ok(StageOutcome::Cancelled);
            }
            AttemptResult::Done(Ok(output)) => {
                tracing::info!(stage = %spec.id, attempt, "stage succeeded");
                record.transition(StageState::Succeeded)?;
                return Ok(StageOutcome::Succeeded(output));
            }
            AttemptResult::Done(Err(err)) => err,
        };

        record.attempt_errors.push(summarize_error(&err));
        if !err.is_transient() || attempt >= max_attempts {
            tracing::error!(
                stage = %spec.id,
                attempt,
                code = %err.code,
                transient = err.is_transient(),
                error = %err.message,
                "stage failed terminally"
            );
            record.transition(StageState::FailedTerminal)?;
            return Ok(StageOutcome::Failed(err));
        }

        record.transition(StageState::FailedRetryable)?;
        let delay = spec.retry.backoff(attempt) + jitter(spec.retry.jitter);
        tracing::warn!(
            stage = %spec.id,
            attempt,
            code = %err.code,
            error = %err.message,
            retry_in_ms = delay.as_millis() as u64,
            "transient stage failure, retrying"
        );
        tokio::select! {
            _ = options.cancel.cancelled() => {
                record.attempt_errors.push(summarize_error(&cancelled(spec.id, attempt)));
                record.transition(StageState::Cancelled)?;
                return Ok(StageOutcome::Cancelled);
            }
            _ = sleep(delay) => {}
        }
        record.transition(StageState::Pending)?;
    }
}

async fn run_attempt(
    stage: &dyn Stage,
    input: &StageData,
    ctx: &StageContext,
    limit: Duration,
    cancel: &CancellationToken,
) -> AttemptResult {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => AttemptResult::Cancelled,
        result = timeout(limit, stage.execute(input, ctx)) => match result {
            Ok(outcome) => AttemptResult::Done(outcome),
            Err(_) => AttemptResult::Done(Err(AppError::new(
                ErrorCategory::TimeoutError,
                format!("stage {} exceeded its {}s timeout", ctx.stage, limit.as_secs_f64()),
            )
            .with_code("PIPE-TIME-001")
            .transient())),
        },
    }
}

fn cancelled(stage: StageId, attempt: u32) -> AppError {
    AppError::new(
        ErrorCategory::CancelledError,
        format!("stage {} cancelled during attempt {}", stage, attempt),
    )
    .with_code("PIPE-CANCEL-001")
    .with_context("attempt", attempt.to_string())
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

fn apply_counters(record: &mut RunRecord, data: &StageData) {
    match data {
        StageData::Extracted(extraction) => {
            record.counters.rows_extracted = extraction.records.len() as u64;
            record.source_sha256 = Some(extraction.source_sha256.clone());
        }
        StageData::Transformed(output) => {
            record.counters.rows_dropped = output.counters.dropped_rows as u64;
            record.counters.rows_deduplicated = output.counters.duplicates_removed as u64;
        }
        StageData::Loaded(summary) => {
            record.counters.rows_loaded = summary.rows_inserted;
            record.counters.rows_deleted = summary.rows_deleted;
        }
        StageData::Empty => {}
    }
}
