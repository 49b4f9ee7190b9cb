use chrono::NaiveDate;
use covid_etl::core::load::{CaseStore, StoreConfig};
use covid_etl::core::pipeline_graph::history::list_runs;
use covid_etl::core::pipeline_graph::staging::StagingArea;
use covid_etl::core::pipeline_graph::{
    execute_cleanup, execute_run, execute_task, standard_registry, PipelineGraph,
    PipelineSettings, RunKind, RunOptions, RunStatus, StageId, StageState,
};
use std::fs;
use tempfile::TempDir;

const SOURCE: &str = "date,state,fips,cases,deaths\n\
2020-06-01,Ohio,39,100,2\n\
2020-06-02,Ohio,39,130,3\n\
2020-06-01,Utah,49,40,0\n\
2020-06-02,Utah,49,55,1\n";

fn logical_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 6, 2).unwrap()
}

fn setup() -> (TempDir, PipelineSettings) {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("raw_data.csv");
    fs::write(&source, SOURCE).unwrap();
    let settings = PipelineSettings {
        source_path: source,
        store: StoreConfig {
            url: format!("sqlite://{}", temp.path().join("cases.db").display()),
            ..StoreConfig::default()
        },
        ..PipelineSettings::default()
    };
    (temp, settings)
}

#[tokio::test]
async fn test_tasks_hand_off_through_staging() {
    let (temp, settings) = setup();
    let state_dir = temp.path().join("state");
    let graph = PipelineGraph::default();
    let registry = standard_registry(&settings);
    let options = RunOptions::new(logical_date(), state_dir.clone());
    let staging = StagingArea::new(&state_dir, logical_date());

    let extract = execute_task(&graph, &registry, StageId::Extract, &options).await.unwrap();
    assert_eq!(extract.status, RunStatus::Succeeded);
    assert_eq!(extract.kind, RunKind::Task("extract".to_string()));
    assert_eq!(extract.counters.rows_extracted, 4);
    assert!(staging.extracted_path().is_file());
    assert!(!staging.transformed_path().exists());

    let transform = execute_task(&graph, &registry, StageId::Transform, &options).await.unwrap();
    assert_eq!(transform.status, RunStatus::Succeeded);
    assert!(staging.transformed_path().is_file());
    assert_eq!(staging.read_transform().unwrap().records.len(), 4);

    let load = execute_task(&graph, &registry, StageId::Load, &options).await.unwrap();
    assert_eq!(load.status, RunStatus::Succeeded);
    assert_eq!(load.counters.rows_loaded, 4);
    assert_eq!(load.exit_code(), 0);

    let store = CaseStore::connect(&settings.store).await.unwrap();
    let rows = store.fetch_all().await.unwrap();
    store.close().await;
    let ohio_second = rows
        .iter()
        .find(|r| r.region == "ohio" && r.date == logical_date())
        .unwrap();
    assert_eq!(ohio_second.new_cases, 30);
    assert_eq!(ohio_second.new_deaths, 1);

    let cleanup = execute_cleanup(&options).unwrap();
    assert_eq!(cleanup.status, RunStatus::Succeeded);
    assert!(cleanup.stages.is_empty());
    assert!(!staging.dir().exists());

    let runs = list_runs(&state_dir, Some(logical_date()), None).unwrap();
    assert_eq!(runs.len(), 4);
}

#[tokio::test]
async fn test_missing_upstream_artifact_fails_task() {
    let (temp, settings) = setup();
    let options = RunOptions::new(logical_date(), temp.path().join("state"));
    let record = execute_task(
        &PipelineGraph::default(),
        &standard_registry(&settings),
        StageId::Load,
        &options,
    )
    .await
    .unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.exit_code(), 1);
    let load = record.stage(StageId::Load).unwrap();
    assert_eq!(load.state, StageState::UpstreamFailed);
    assert_eq!(load.attempts, 0);
    assert_eq!(load.last_error().unwrap().code, "PIPE-STAGE-002");
    assert!(!temp.path().join("cases.db").exists());
}

#[tokio::test]
async fn test_cleanup_is_safe_without_staging() {
    let (temp, _) = setup();
    let options = RunOptions::new(logical_date(), temp.path().join("state"));
    let first = execute_cleanup(&options).unwrap();
    let second = execute_cleanup(&options).unwrap();
    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(first.kind, RunKind::Task("cleanup".to_string()));
}

#[tokio::test]
async fn test_full_run_does_not_touch_staging() {
    let (temp, settings) = setup();
    let state_dir = temp.path().join("state");
    let options = RunOptions::new(logical_date(), state_dir.clone());
    let record = execute_run(&PipelineGraph::default(), &standard_registry(&settings), &options)
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert!(!state_dir.join("staging").exists());
}
