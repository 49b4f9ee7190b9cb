use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const SOURCE: &str = "date,state,fips,cases,deaths\n\
2020-03-14,Ohio,39,5,0\n\
2020-03-15,Ohio,39,11,0\n\
2020-03-14,Utah,49,2,0\n\
2020-03-15,Utah,49,3,0\n";

fn covid_etl() -> Command {
    let mut cmd = Command::cargo_bin("covid-etl").unwrap();
    cmd.env_remove("AIRFLOW_CTX_DAG_ID")
        .env_remove("COVID_ETL_SCHEDULED")
        .env_remove("COVID_ETL_STORE_URL")
        .env_remove("COVID_ETL_SOURCE_PATH")
        .env_remove("COVID_ETL_STATE_DIR");
    cmd
}

/// Workspace with a source file and a config using relative paths.
fn workspace() -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("data")).unwrap();
    fs::write(temp.path().join("data/raw_data.csv"), SOURCE).unwrap();
    fs::write(
        temp.path().join("covid-etl.toml"),
        "[store]\nurl = \"sqlite://data/processed/cases.db\"\n\n[stages.load]\nretries = 0\n",
    )
    .unwrap();
    temp
}

fn ws_arg(path: &Path) -> String {
    path.display().to_string()
}

#[test]
fn test_run_command_help() {
    covid_etl()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("whole graph in-process"));
}

#[test]
fn test_task_command_help() {
    covid_etl()
        .args(["task", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("runs one stage exactly once"));
}

#[test]
fn test_graph_command_help() {
    covid_etl()
        .args(["graph", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("declared tasks with their dependencies"));
}

#[test]
fn test_status_command_help() {
    covid_etl()
        .args(["status", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("lists persisted run records"));
}

#[test]
fn test_inspect_command_help() {
    covid_etl()
        .args(["inspect", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("The store is never touched"));
}

#[test]
fn test_short_help_lists_about() {
    covid_etl()
        .args(["run", "-h"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Run extract, transform and load for one logical date",
        ));
    covid_etl()
        .args(["inspect", "-h"])
        .assert()
        .success()
        .stdout(predicate::str::contains("without loading it"));
}

#[test]
fn test_long_help_documents_environment() {
    covid_etl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Exit codes: 0 success"))
        .stdout(predicate::str::contains("COVID_ETL_STORE_URL"))
        .stdout(predicate::str::contains("COVID_ETL_LOAD_SCOPE"));
}

#[test]
fn test_version_command() {
    covid_etl()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_graph_exports_dot_and_json() {
    let temp = workspace();
    covid_etl()
        .args(["graph", "--format", "dot", "--workspace", &ws_arg(temp.path())])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("digraph"))
        .stdout(predicate::str::contains("transform (retries="));

    let output = covid_etl()
        .args(["graph", "--workspace", &ws_arg(temp.path())])
        .output()
        .unwrap();
    assert!(output.status.success());
    let descriptor: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rendered = descriptor.to_string();
    for task in ["extract", "transform", "load"] {
        assert!(rendered.contains(task), "missing {} in {}", task, rendered);
    }
}

#[test]
fn test_inspect_reports_profile() {
    let temp = workspace();
    covid_etl()
        .args(["inspect", "--workspace", &ws_arg(temp.path())])
        .assert()
        .success()
        .stdout(predicate::str::contains("Rows: 4"))
        .stdout(predicate::str::contains("Regions: 2"));
    assert!(!temp.path().join("data/processed/cases.db").exists());
}

#[test]
fn test_inspect_source_is_relative_to_workspace() {
    let temp = workspace();
    fs::write(temp.path().join("data/extra.csv"), SOURCE.replace("Utah", "Iowa")).unwrap();
    let elsewhere = TempDir::new().unwrap();
    covid_etl()
        .current_dir(elsewhere.path())
        .args(["inspect", "--source", "data/extra.csv", "--workspace", &ws_arg(temp.path())])
        .assert()
        .success()
        .stdout(predicate::str::contains("Rows: 4"))
        .stdout(predicate::str::contains("Iowa"));
}

#[test]
fn test_invalid_config_rejected_by_graph_and_inspect() {
    let temp = workspace();
    fs::write(
        temp.path().join("covid-etl.toml"),
        "[transform]\nmax_drop_fraction = 3.0\n",
    )
    .unwrap();
    for command in ["graph", "inspect"] {
        covid_etl()
            .args([command, "--workspace", &ws_arg(temp.path())])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("max_drop_fraction"));
    }
}

#[test]
fn test_run_then_status() {
    let temp = workspace();
    covid_etl()
        .args(["run", "--date", "2020-03-15", "--workspace", &ws_arg(temp.path())])
        .assert()
        .success()
        .stdout(predicate::str::contains("Succeeded"))
        .stdout(predicate::str::contains("loaded=4"));
    assert!(temp.path().join("data/processed/cases.db").is_file());

    covid_etl()
        .args(["status", "--date", "2020-03-15", "--workspace", &ws_arg(temp.path())])
        .assert()
        .success()
        .stdout(predicate::str::contains("RUN_ID"))
        .stdout(predicate::str::contains("Succeeded"));

    covid_etl()
        .args(["status", "--date", "2020-03-16", "--workspace", &ws_arg(temp.path())])
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs recorded for 2020-03-16"));
}

#[test]
fn test_task_without_staged_input_fails() {
    let temp = workspace();
    covid_etl()
        .args(["task", "transform", "--date", "2020-03-15"])
        .args(["--workspace", &ws_arg(temp.path())])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("PIPE-STAGE-002"));
}

#[test]
fn test_task_sequence_succeeds() {
    let temp = workspace();
    for task in ["extract", "transform", "load", "cleanup"] {
        covid_etl()
            .args(["task", task, "--date", "2020-03-15", "--workspace", &ws_arg(temp.path())])
            .assert()
            .success();
    }
    assert!(temp.path().join("data/processed/cases.db").is_file());
}

#[test]
fn test_invalid_config_fails() {
    let temp = workspace();
    fs::write(
        temp.path().join("covid-etl.toml"),
        "[transform]\nmax_drop_fraction = 3.0\n",
    )
    .unwrap();
    covid_etl()
        .args(["run", "--date", "2020-03-15", "--workspace", &ws_arg(temp.path())])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("max_drop_fraction"));
}

#[test]
fn test_unknown_run_id_is_error() {
    let temp = workspace();
    covid_etl()
        .args(["status", "--run-id", "not-a-uuid", "--workspace", &ws_arg(temp.path())])
        .assert()
        .failure();
}
