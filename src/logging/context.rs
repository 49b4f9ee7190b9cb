use crate::cli::Command;
use std::env;

/// Execution contexts that influence how logging is routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionContext {
    /// An operator running commands from a terminal.
    Interactive,
    /// A task launched by an orchestrator whose log capture reads the console.
    Scheduled,
}

impl ExecutionContext {
    /// Scheduled runs emit machine-readable console lines.
    pub fn structured_console(self) -> bool {
        matches!(self, ExecutionContext::Scheduled)
    }
}

/// Derive the active execution context from a parsed CLI command plus overrides.
pub fn detect_context(command: &Command) -> ExecutionContext {
    if let Command::Task(_) = command {
        return ExecutionContext::Scheduled;
    }
    if scheduled_override_enabled() {
        return ExecutionContext::Scheduled;
    }
    ExecutionContext::Interactive
}

fn scheduled_override_enabled() -> bool {
    let airflow = env::var("AIRFLOW_CTX_DAG_ID")
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);
    let explicit = env::var("COVID_ETL_SCHEDULED")
        .map(|value| value.trim() == "1")
        .unwrap_or(false);
    airflow || explicit
}
