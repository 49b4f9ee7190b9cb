use covid_etl::core::config::{ConfigLoader, ConfigValidator, CONFIG_FILE_NAME};
use covid_etl::core::load::ScopeMode;
use covid_etl::core::pipeline_graph::StageId;
use serial_test::serial;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn clear_covid_etl_env() {
    for v in &[
        "COVID_ETL_SOURCE_PATH",
        "COVID_ETL_SOURCE_DELIMITER",
        "COVID_ETL_STORE_URL",
        "COVID_ETL_STORE_TABLE",
        "COVID_ETL_MAX_DROP_FRACTION",
        "COVID_ETL_LOAD_SCOPE",
        "COVID_ETL_STATE_DIR",
    ] {
        env::remove_var(v);
    }
}

const WORKSPACE_CONFIG: &str = r#"
[source]
path = "inbox/us-states.csv"
date_formats = ["%Y-%m-%d", "%m/%d/%Y"]

[transform]
max_drop_fraction = 0.2

[store]
url = "sqlite://warehouse/cases.db"
table = "daily_cases"

[run]
state_dir = "var/covid-etl"

[stages.load]
retries = 4
retry_delay = "2s"
timeout = "90s"
"#;

/// Test integration of config loading with environment variables
#[test]
#[serial]
fn test_config_loading_integration() {
    clear_covid_etl_env();
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join(CONFIG_FILE_NAME), WORKSPACE_CONFIG).unwrap();

    let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();
    assert_eq!(config.source.path, PathBuf::from("inbox/us-states.csv"));
    assert_eq!(config.source.date_formats.len(), 2);
    assert_eq!(config.transform.max_drop_fraction, 0.2);
    assert_eq!(config.store.table, "daily_cases");
    assert_eq!(config.load.scope, ScopeMode::BatchRange);
    assert_eq!(config.run.state_dir, PathBuf::from("var/covid-etl"));
    ConfigValidator::validate(&config).unwrap();

    env::set_var("COVID_ETL_STORE_TABLE", "cases_override");
    env::set_var("COVID_ETL_LOAD_SCOPE", "logical_date");
    env::set_var("COVID_ETL_STATE_DIR", "/tmp/etl-state");

    let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();
    assert_eq!(config.store.table, "cases_override");
    assert_eq!(config.load.scope, ScopeMode::LogicalDate);
    assert_eq!(config.run.state_dir, PathBuf::from("/tmp/etl-state"));
    // untouched by env
    assert_eq!(config.source.path, PathBuf::from("inbox/us-states.csv"));

    clear_covid_etl_env();
}

#[test]
#[serial]
fn test_explicit_config_wins_over_workspace() {
    clear_covid_etl_env();
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join(CONFIG_FILE_NAME), WORKSPACE_CONFIG).unwrap();
    let explicit = temp_dir.path().join("nightly.toml");
    fs::write(&explicit, "[store]\ntable = \"nightly_cases\"\n").unwrap();

    let config = ConfigLoader::load(temp_dir.path(), Some(&explicit)).unwrap();
    assert_eq!(config.store.table, "nightly_cases");
    assert_eq!(config.source.path, PathBuf::from("data/raw_data.csv"));
}

#[test]
#[serial]
fn test_stage_overrides_reach_the_graph() {
    clear_covid_etl_env();
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join(CONFIG_FILE_NAME), WORKSPACE_CONFIG).unwrap();

    let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();
    let graph = config.pipeline_graph().unwrap();
    let load = graph.stage(StageId::Load).unwrap();
    assert_eq!(load.retry.retries, 4);
    assert_eq!(load.retry.retry_delay, Duration::from_secs(2));
    assert!(load.retry.max_retry_delay >= load.retry.retry_delay);
    assert_eq!(load.timeout, Duration::from_secs(90));
    assert_eq!(load.upstream, vec![StageId::Transform]);

    let extract = graph.stage(StageId::Extract).unwrap();
    assert_eq!(extract.timeout, Duration::from_secs(600));
}

#[test]
#[serial]
fn test_invalid_workspace_configs_are_rejected() {
    clear_covid_etl_env();
    let cases = [
        ("[transform]\nmax_drop_fraction = 1.5\n", "CFG-TRANSFORM-001"),
        ("[store]\ntable = \"cases; drop\"\n", "CFG-STORE-002"),
        ("[source]\ndelimiter = \"||\"\n", "CFG-SOURCE-001"),
        ("[stages.publish]\nretries = 1\n", "CFG-STAGE-001"),
        ("[stages.extract]\ntimeout = \"soon\"\n", "CFG-DUR-001"),
    ];

    for (content, code) in cases {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(CONFIG_FILE_NAME), content).unwrap();
        let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(err.code, code, "config {:?}", content);
    }
}

#[test]
#[serial]
fn test_custom_column_layout() {
    clear_covid_etl_env();
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join(CONFIG_FILE_NAME),
        r#"
[[source.columns]]
name = "report_date"
kind = "date"
role = "date"

[[source.columns]]
name = "province"
kind = "text"
role = "region"

[[source.columns]]
name = "confirmed"
kind = "count"
role = "cumulative_cases"

[[source.columns]]
name = "fatalities"
kind = "count"
role = "cumulative_deaths"
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();
    ConfigValidator::validate(&config).unwrap();
    let schema = config.schema().unwrap();
    assert_eq!(
        schema.column_names(),
        vec!["report_date", "province", "confirmed", "fatalities"]
    );
}
