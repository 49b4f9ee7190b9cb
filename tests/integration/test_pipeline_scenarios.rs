use chrono::{Duration as ChronoDuration, NaiveDate};
use covid_etl::core::dataset::SourceSchema;
use covid_etl::core::error::AppError;
use covid_etl::core::extract::{ExtractOptions, ExtractionError, Extractor};
use covid_etl::core::load::{CaseStore, ScopeMode, StoreConfig, StoredRecord};
use covid_etl::core::pipeline_graph::{
    execute_run, standard_registry, PipelineGraph, PipelineSettings, RetryPolicy, RunOptions,
    RunRecord, RunStatus, StageId, StageState,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

fn day(offset: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 3, 1).unwrap() + ChronoDuration::days(offset)
}

/// 100 rows: two regions over 47 days, one repeated (alpha, day 9) key whose
/// later row carries the correct counts, and five rows with unparseable dates.
fn scenario_csv() -> String {
    let mut csv = String::from("date,state,fips,cases,deaths\n");
    for d in 0..47i64 {
        let cases = 10 * (d + 1);
        if d == 9 {
            csv.push_str(&format!("{},Alpha,01,{},{}\n", day(d), cases - 1, d));
        }
        csv.push_str(&format!("{},Alpha,01,{},{}\n", day(d), cases, d));
        csv.push_str(&format!("{},Beta,02,{},{}\n", day(d), 5 * (d + 1), 0));
    }
    for bad in ["2020-13-01", "not a date", "", "03/15/2020", "2020-02-30"] {
        csv.push_str(&format!("{},Beta,02,1,0\n", bad));
    }
    csv
}

struct Workspace {
    _temp: TempDir,
    source: PathBuf,
    state_dir: PathBuf,
    store: StoreConfig,
}

fn workspace(csv: &str) -> Workspace {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("raw_data.csv");
    fs::write(&source, csv).unwrap();
    let store = StoreConfig {
        url: format!("sqlite://{}", temp.path().join("db/cases.db").display()),
        ..StoreConfig::default()
    };
    Workspace {
        state_dir: temp.path().join("state"),
        source,
        store,
        _temp: temp,
    }
}

fn settings(ws: &Workspace, scope: ScopeMode) -> PipelineSettings {
    PipelineSettings {
        source_path: ws.source.clone(),
        store: ws.store.clone(),
        scope,
        ..PipelineSettings::default()
    }
}

async fn stored_rows(store: &StoreConfig) -> Vec<StoredRecord> {
    let store = CaseStore::connect(store).await.unwrap();
    let rows = store.fetch_all().await.unwrap();
    store.close().await;
    rows
}

/// Persisted content without the load timestamp.
fn content(rows: &[StoredRecord]) -> Vec<(String, NaiveDate, i64, i64, i64, i64)> {
    rows.iter()
        .map(|r| (r.region.clone(), r.date, r.cases, r.deaths, r.new_cases, r.new_deaths))
        .collect()
}

async fn run_pipeline(ws: &Workspace, scope: ScopeMode, date: NaiveDate) -> RunRecord {
    let registry = standard_registry(&settings(ws, scope));
    let options = RunOptions::new(date, ws.state_dir.clone());
    execute_run(&PipelineGraph::default(), &registry, &options)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_hundred_row_scenario_counters() {
    let ws = workspace(&scenario_csv());
    let record = run_pipeline(&ws, ScopeMode::BatchRange, day(46)).await;

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.exit_code(), 0);
    assert_eq!(record.counters.rows_extracted, 100);
    assert_eq!(record.counters.rows_dropped, 5);
    assert_eq!(record.counters.rows_deduplicated, 1);
    assert_eq!(record.counters.rows_loaded, 94);
    assert!(record.source_sha256.is_some());
    for stage in &record.stages {
        assert_eq!(stage.state, StageState::Succeeded);
        assert_eq!(stage.attempts, 1);
    }

    let rows = stored_rows(&ws.store).await;
    assert_eq!(rows.len(), 94);

    let alpha_day_nine = rows
        .iter()
        .find(|r| r.region == "alpha" && r.date == day(9))
        .unwrap();
    assert_eq!(alpha_day_nine.cases, 100, "last-seen duplicate wins");
    assert_eq!(alpha_day_nine.new_cases, 10);

    for region in ["alpha", "beta"] {
        let first = rows.iter().find(|r| r.region == region).unwrap();
        assert_eq!(first.date, day(0));
        assert_eq!(first.new_cases, 0);
        assert_eq!(first.new_deaths, 0);
    }
    assert!(rows.iter().all(|r| r.run_date == day(46)));
}

#[tokio::test]
async fn test_rerun_same_date_is_idempotent() {
    let ws = workspace(&scenario_csv());
    let first = run_pipeline(&ws, ScopeMode::BatchRange, day(46)).await;
    let after_first = content(&stored_rows(&ws.store).await);

    let second = run_pipeline(&ws, ScopeMode::BatchRange, day(46)).await;
    let after_second = content(&stored_rows(&ws.store).await);

    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(second.counters.rows_deleted, 94);
    assert_eq!(second.counters.rows_loaded, 94);
    assert_eq!(after_first, after_second);
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn test_rerun_replaces_only_its_scope() {
    let ws = workspace(&scenario_csv());
    run_pipeline(&ws, ScopeMode::BatchRange, day(46)).await;
    let before = content(&stored_rows(&ws.store).await);

    // Corrected figures for day 20 arrive; the orchestrator reruns that date only.
    let mut corrected = String::from("date,state,fips,cases,deaths\n");
    corrected.push_str(&format!("{},Alpha,01,{},{}\n", day(20), 999, 20));
    fs::write(&ws.source, corrected).unwrap();

    let record = run_pipeline(&ws, ScopeMode::LogicalDate, day(20)).await;
    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.counters.rows_deleted, 2);
    assert_eq!(record.counters.rows_loaded, 1);

    let after = content(&stored_rows(&ws.store).await);
    let untouched = |rows: &[(String, NaiveDate, i64, i64, i64, i64)]| {
        rows.iter()
            .filter(|r| r.1 != day(20))
            .cloned()
            .collect::<Vec<_>>()
    };
    assert_eq!(untouched(&before), untouched(&after));
    let replaced: Vec<_> = after.iter().filter(|r| r.1 == day(20)).collect();
    assert_eq!(replaced.len(), 1);
    assert_eq!(replaced[0].0, "alpha");
    assert_eq!(replaced[0].2, 999);
}

#[tokio::test]
async fn test_batch_range_rerun_leaves_other_dates() {
    let ws = workspace(&scenario_csv());
    run_pipeline(&ws, ScopeMode::BatchRange, day(46)).await;

    let mut partial = String::from("date,state,fips,cases,deaths\n");
    for d in 10..=12i64 {
        partial.push_str(&format!("{},Gamma,03,{},0\n", day(d), d));
    }
    fs::write(&ws.source, partial).unwrap();
    let record = run_pipeline(&ws, ScopeMode::BatchRange, day(12)).await;
    assert_eq!(record.counters.rows_deleted, 6);
    assert_eq!(record.counters.rows_loaded, 3);

    let rows = stored_rows(&ws.store).await;
    assert_eq!(rows.len(), 94 - 6 + 3);
    assert!(rows.iter().any(|r| r.region == "alpha" && r.date == day(9)));
    assert!(!rows.iter().any(|r| r.region == "alpha" && r.date == day(11)));
    assert!(rows.iter().any(|r| r.region == "gamma" && r.date == day(11)));
}

#[tokio::test]
async fn test_drop_threshold_fails_run_before_load() {
    let mut csv = String::from("date,state,fips,cases,deaths\n");
    for d in 0..8i64 {
        csv.push_str(&format!("{},Alpha,01,{},0\n", day(d), d));
    }
    csv.push_str("someday,Alpha,01,1,0\nlater,Alpha,01,1,0\n");
    let ws = workspace(&csv);

    let record = run_pipeline(&ws, ScopeMode::BatchRange, day(7)).await;
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.exit_code(), 1);

    let transform = record.stage(StageId::Transform).unwrap();
    assert_eq!(transform.state, StageState::FailedTerminal);
    assert_eq!(transform.attempts, 1, "terminal errors are not retried");
    assert_eq!(transform.last_error().unwrap().code, "TRF-DROP-001");
    assert_eq!(
        record.stage(StageId::Load).unwrap().state,
        StageState::UpstreamFailed
    );
    assert!(!db_file(&ws.store).exists(), "load never opened the store");
}

#[tokio::test]
async fn test_missing_source_is_terminal_extraction_failure() {
    let ws = workspace("date,state,fips,cases,deaths\n");
    fs::remove_file(&ws.source).unwrap();

    let record = run_pipeline(&ws, ScopeMode::BatchRange, day(0)).await;
    assert_eq!(record.status, RunStatus::Failed);
    let extract = record.stage(StageId::Extract).unwrap();
    assert_eq!(extract.state, StageState::FailedTerminal);
    assert_eq!(extract.last_error().unwrap().code, "EXT-SRC-001");
    assert_eq!(
        record.stage(StageId::Transform).unwrap().state,
        StageState::UpstreamFailed
    );
}

/// Large enough that the blocking read is still in flight when a zero
/// timeout fires.
fn large_csv() -> String {
    let mut csv = String::from("date,state,fips,cases,deaths\n");
    for d in 0..400i64 {
        for region in 0..100 {
            csv.push_str(&format!("{},Region {},00,{},0\n", day(d), region, d));
        }
    }
    csv
}

#[tokio::test]
async fn test_extraction_timeout_is_transient() {
    let ws = workspace(&large_csv());
    let extractor = Extractor::new(
        SourceSchema::default(),
        ExtractOptions {
            io_timeout: Duration::ZERO,
            ..ExtractOptions::default()
        },
    );

    let err = extractor.extract_path(&ws.source).await.unwrap_err();
    assert!(matches!(err, ExtractionError::Timeout { .. }), "got {:?}", err);
    assert!(err.is_transient());
    let app: AppError = err.into();
    assert_eq!(app.code, "EXT-TIME-001");
    assert!(app.retryable);
}

#[tokio::test]
async fn test_extraction_timeout_is_retried_then_tempfail() {
    let ws = workspace(&large_csv());
    let mut settings = settings(&ws, ScopeMode::BatchRange);
    settings.extract.io_timeout = Duration::ZERO;

    let retry = RetryPolicy {
        retries: 1,
        retry_delay: Duration::from_millis(5),
        backoff_multiplier: 1.0,
        max_retry_delay: Duration::from_millis(5),
        jitter: Duration::ZERO,
    };
    let mut overrides = HashMap::new();
    overrides.insert(StageId::Extract, (retry, Duration::from_secs(30)));
    let graph = PipelineGraph::standard(&overrides).unwrap();

    let options = RunOptions::new(day(0), ws.state_dir.clone());
    let record = execute_run(&graph, &standard_registry(&settings), &options)
        .await
        .unwrap();

    let extract = record.stage(StageId::Extract).unwrap();
    assert_eq!(extract.state, StageState::FailedTerminal);
    assert_eq!(extract.attempts, 2);
    assert!(extract
        .attempt_errors
        .iter()
        .all(|e| e.code == "EXT-TIME-001" && e.retryable));
    assert_eq!(record.exit_code(), 75);
    assert!(!db_file(&ws.store).exists());
}

fn db_file(store: &StoreConfig) -> PathBuf {
    Path::new(store.url.trim_start_matches("sqlite://")).to_path_buf()
}
