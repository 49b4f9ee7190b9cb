use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use covid_etl::core::dataset::{CleanedRecord, LoadBatch, RunScope};
use covid_etl::core::load::{self, CaseStore, LoadError, ScopeMode, StoreConfig};
use covid_etl::core::pipeline_graph::{
    execute_run, standard_registry, PipelineGraph, PipelineSettings, RetryPolicy, RunOptions,
    RunStatus, StageId, StageState,
};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 4, day).unwrap()
}

fn record(region: &str, day: u32, cases: u64) -> CleanedRecord {
    CleanedRecord {
        date: date(day),
        region: region.to_string(),
        cases,
        deaths: 0,
        new_cases: 0,
        new_deaths: 0,
        source_line: day as u64 + 1,
    }
}

fn store_config(temp: &TempDir) -> StoreConfig {
    StoreConfig {
        url: format!("sqlite://{}", temp.path().join("cases.db").display()),
        ..StoreConfig::default()
    }
}

#[tokio::test]
async fn test_failed_replace_rolls_back_delete() {
    let temp = TempDir::new().unwrap();
    let store = CaseStore::connect(&store_config(&temp)).await.unwrap();
    store.ensure_schema().await.unwrap();

    let original = vec![record("ohio", 1, 10), record("ohio", 2, 12), record("utah", 1, 3)];
    store
        .replace_scope(RunScope::new(date(1), date(2)), &original, date(2), Utc::now())
        .await
        .unwrap();
    let before = store.fetch_all().await.unwrap();
    assert_eq!(before.len(), 3);

    // Same key twice: the second insert violates the primary key after the
    // delete already ran inside the transaction.
    let conflicting = vec![record("ohio", 1, 20), record("ohio", 1, 21)];
    let err = store
        .replace_scope(RunScope::new(date(1), date(2)), &conflicting, date(2), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::ConstraintViolation { .. }), "got {:?}", err);
    assert!(!err.is_transient());

    assert_eq!(store.fetch_all().await.unwrap(), before);
    store.close().await;
}

#[tokio::test]
async fn test_scope_bounds_are_inclusive() {
    let temp = TempDir::new().unwrap();
    let config = store_config(&temp);
    let batch = LoadBatch::new(
        date(5),
        (1..=5).map(|d| record("ohio", d, d as u64)).collect(),
    );
    load::load_batch(&config, ScopeMode::BatchRange, &batch).await.unwrap();

    let store = CaseStore::connect(&config).await.unwrap();
    let outcome = store
        .replace_scope(
            RunScope::new(date(2), date(4)),
            &[record("ohio", 3, 30)],
            date(5),
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.rows_deleted, 3);
    assert_eq!(outcome.rows_inserted, 1);

    let dates: Vec<NaiveDate> = store.fetch_all().await.unwrap().iter().map(|r| r.date).collect();
    assert_eq!(dates, vec![date(1), date(3), date(5)]);
    assert_eq!(store.count().await.unwrap(), 3);
    let middle = store.fetch_range(RunScope::new(date(2), date(4))).await.unwrap();
    assert_eq!(middle.len(), 1);
    assert_eq!(middle[0].cases, 30);
    store.close().await;
}

#[tokio::test]
async fn test_unreachable_store_is_retried_then_terminal() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("raw.csv");
    fs::write(
        &source,
        "date,state,fips,cases,deaths\n2020-04-01,Ohio,39,1,0\n2020-04-02,Ohio,39,3,0\n",
    )
    .unwrap();

    // A store that already holds data for the same dates stays untouched.
    let healthy = store_config(&temp);
    let existing = LoadBatch::new(date(2), vec![record("ohio", 1, 7), record("ohio", 2, 9)]);
    load::load_batch(&healthy, ScopeMode::BatchRange, &existing).await.unwrap();

    // The parent of the database path is a regular file, so the store can
    // never be opened.
    let blocker = temp.path().join("not-a-dir");
    fs::write(&blocker, "x").unwrap();
    let unreachable = StoreConfig {
        url: format!("sqlite://{}", blocker.join("cases.db").display()),
        ..StoreConfig::default()
    };

    let direct = load::load_batch(&unreachable, ScopeMode::BatchRange, &existing)
        .await
        .unwrap_err();
    assert!(matches!(direct, LoadError::Connectivity { .. }));
    assert!(direct.is_transient());

    let fast_retry = RetryPolicy {
        retries: 2,
        retry_delay: Duration::from_millis(10),
        backoff_multiplier: 2.0,
        max_retry_delay: Duration::from_millis(50),
        jitter: Duration::ZERO,
    };
    let mut overrides = HashMap::new();
    overrides.insert(StageId::Load, (fast_retry, Duration::from_secs(30)));
    let graph = PipelineGraph::standard(&overrides).unwrap();

    let settings = PipelineSettings {
        source_path: source,
        store: unreachable,
        ..PipelineSettings::default()
    };
    let registry = standard_registry(&settings);
    let options = RunOptions::new(date(2), temp.path().join("state"));
    let record = execute_run(&graph, &registry, &options).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    let load = record.stage(StageId::Load).unwrap();
    assert_eq!(load.state, StageState::FailedTerminal);
    assert_eq!(load.attempts, 3);
    assert_eq!(load.attempt_errors.len(), 3);
    assert!(load.attempt_errors.iter().all(|e| e.code == "LOD-CONN-001" && e.retryable));
    assert_eq!(record.exit_code(), 75);

    let states: Vec<StageState> = load.transitions.iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        vec![
            StageState::Running,
            StageState::FailedRetryable,
            StageState::Pending,
            StageState::Running,
            StageState::FailedRetryable,
            StageState::Pending,
            StageState::Running,
            StageState::FailedTerminal,
        ]
    );

    let store = CaseStore::connect(&healthy).await.unwrap();
    let rows = store.fetch_all().await.unwrap();
    assert_eq!(rows.iter().map(|r| r.cases).collect::<Vec<_>>(), vec![7, 9]);
    store.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_on_disjoint_dates() {
    let temp = TempDir::new().unwrap();
    let config = store_config(&temp);
    let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();

    let mut handles = Vec::new();
    for worker in 0..4i64 {
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let records: Vec<CleanedRecord> = (0..100i64)
                .flat_map(|day| {
                    (0..5).map(move |region| CleanedRecord {
                        date: start + ChronoDuration::days(worker * 100 + day),
                        region: format!("region-{}", region),
                        cases: day as u64,
                        deaths: 0,
                        new_cases: 0,
                        new_deaths: 0,
                        source_line: 2,
                    })
                })
                .collect();
            let run_date = start + ChronoDuration::days(worker * 100 + 99);
            let batch = LoadBatch::new(run_date, records);
            load::load_batch(&config, ScopeMode::BatchRange, &batch).await
        }));
    }
    for handle in handles {
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.rows_inserted, 500);
        assert_eq!(summary.rows_deleted, 0);
    }

    let store = CaseStore::connect(&config).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 2000);
    store.close().await;
}
