use crate::core::types::OutputFormat;
use chrono::NaiveDate;
use clap::Args;
use std::fmt;
use std::path::PathBuf;

/// Workspace location and config file shared by every command.
#[derive(Args, Clone, Debug)]
pub struct WorkspaceArgs {
    /// Workspace holding covid-etl.toml and .covid-etl/ (default: current directory)
    #[arg(
        long = "workspace",
        default_value = ".",
        value_name = "PATH",
        help_heading = "Configuration"
    )]
    pub path: PathBuf,

    /// Path to custom config file (default: {workspace}/covid-etl.toml)
    #[arg(long, value_name = "FILE", help_heading = "Configuration")]
    pub config: Option<PathBuf>,
}

impl Default for WorkspaceArgs {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            config: None,
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,

    /// Logical date of the run (default: today, UTC)
    #[arg(long, value_name = "YYYY-MM-DD")]
    pub date: Option<NaiveDate>,

    /// Read this file instead of source.path
    #[arg(long, value_name = "FILE", help_heading = "Overrides")]
    pub source: Option<PathBuf>,

    /// Write into this store URL instead of store.url
    #[arg(long, value_name = "URL", help_heading = "Overrides")]
    pub store_url: Option<String>,

    /// Overwrite scope (batch_range or logical_date) instead of load.scope
    #[arg(long, value_name = "SCOPE", help_heading = "Overrides")]
    pub scope: Option<String>,

    /// Emit either terminal-friendly text or machine-readable JSON
    #[arg(long, default_value = "text", value_name = "FORMAT")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, clap::ValueEnum, Debug, PartialEq, Eq)]
pub enum TaskName {
    Extract,
    Transform,
    Load,
    /// Remove the staging directory of the logical date
    Cleanup,
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskName::Extract => "extract",
            TaskName::Transform => "transform",
            TaskName::Load => "load",
            TaskName::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

#[derive(Args, Clone, Debug)]
pub struct TaskArgs {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,

    /// Task to run
    #[arg(value_name = "TASK")]
    pub task: TaskName,

    /// Logical date handed over by the orchestrator
    #[arg(long, value_name = "YYYY-MM-DD")]
    pub date: NaiveDate,

    /// Emit either terminal-friendly text or machine-readable JSON
    #[arg(long, default_value = "text", value_name = "FORMAT")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, clap::ValueEnum, Debug, Default, PartialEq, Eq)]
pub enum GraphFormat {
    /// Task descriptors with dependencies and retry settings
    #[default]
    Json,
    /// Graphviz DOT
    Dot,
}

#[derive(Args, Clone, Debug)]
pub struct GraphArgs {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,

    #[arg(long, default_value = "json", value_name = "FORMAT")]
    pub format: GraphFormat,
}

#[derive(Args, Clone, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,

    /// Show a single run in full
    #[arg(long, value_name = "RUN_ID")]
    pub run_id: Option<String>,

    /// Only list runs for this logical date
    #[arg(long, value_name = "YYYY-MM-DD")]
    pub date: Option<NaiveDate>,

    /// Maximum number of runs listed (default: 20)
    #[arg(long, default_value = "20")]
    pub limit: usize,

    #[arg(long, default_value = "text", value_name = "FORMAT")]
    pub format: OutputFormat,
}

#[derive(Args, Clone, Debug)]
pub struct InspectArgs {
    #[command(flatten)]
    pub workspace: WorkspaceArgs,

    /// File to profile, relative to the workspace (default: source.path)
    #[arg(long, value_name = "FILE")]
    pub source: Option<PathBuf>,

    /// Length of every ranked list in the profile (default: 10)
    #[arg(long, default_value = "10")]
    pub top: usize,

    #[arg(long, default_value = "text", value_name = "FORMAT")]
    pub format: OutputFormat,
}
