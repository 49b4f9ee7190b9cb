use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn workspace(temp_dir: &TempDir) -> PathBuf {
    let workspace = temp_dir.path().to_path_buf();
    fs::create_dir_all(workspace.join("data")).expect("failed to create data dir");
    fs::write(
        workspace.join("data/raw_data.csv"),
        "date,state,fips,cases,deaths\n2020-03-15,Ohio,39,11,0\n",
    )
    .expect("failed to write source");
    workspace
}

fn log_file_path(workspace: &Path) -> PathBuf {
    workspace.join(".covid-etl").join("logs").join("covid-etl.log")
}

fn covid_etl() -> Command {
    let mut cmd = Command::cargo_bin("covid-etl").expect("failed to build binary");
    cmd.env_remove("RUST_LOG")
        .env_remove("COVID_ETL_LOG_DIR")
        .env_remove("AIRFLOW_CTX_DAG_ID")
        .env_remove("COVID_ETL_SCHEDULED");
    cmd
}

#[test]
fn interactive_run_logs_text_to_console_and_file() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let workspace = workspace(&temp_dir);

    covid_etl()
        .args(["run", "--date", "2020-03-15", "--workspace"])
        .arg(&workspace)
        .assert()
        .success()
        .stderr(predicate::str::contains("pipeline run started"))
        .stderr(predicate::str::contains("\"level\":").not());

    let contents = fs::read_to_string(log_file_path(&workspace)).expect("failed to read log file");
    assert!(contents.contains("pipeline run started"));
}

#[test]
fn scheduled_environment_switches_console_to_json() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let workspace = workspace(&temp_dir);

    let output = covid_etl()
        .env("AIRFLOW_CTX_DAG_ID", "covid_etl_daily")
        .args(["run", "--date", "2020-03-15", "--format", "json", "--workspace"])
        .arg(&workspace)
        .output()
        .expect("failed to run binary");
    assert!(output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    let first = stderr.lines().next().expect("no log lines on stderr");
    let event: serde_json::Value = serde_json::from_str(first).expect("log line is not JSON");
    assert_eq!(event["level"], "INFO");

    // stdout carries only the run record
    let record: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout is not a run record");
    assert_eq!(record["status"], "Succeeded");
}

#[test]
fn logging_config_redirects_log_dir() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let workspace = workspace(&temp_dir);
    fs::create_dir_all(workspace.join(".covid-etl")).expect("failed to create config dir");
    fs::write(
        workspace.join(".covid-etl/logging.toml"),
        "[logging]\nlog_dir = \"var/logs\"\n",
    )
    .expect("failed to write logging config");

    covid_etl()
        .args(["graph", "--workspace"])
        .arg(&workspace)
        .assert()
        .success();
    covid_etl()
        .args(["task", "extract", "--date", "2020-03-15", "--workspace"])
        .arg(&workspace)
        .assert()
        .success();

    let contents = fs::read_to_string(workspace.join("var/logs/covid-etl.log"))
        .expect("failed to read redirected log file");
    assert!(contents.contains("staged stage output"));
    assert!(!log_file_path(&workspace).exists());
}
