pub mod args;
pub mod commands;

pub use args::{GraphArgs, InspectArgs, RunArgs, StatusArgs, TaskArgs, WorkspaceArgs};
use crate::core::config::ConfigLoader;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

const HELP_TEMPLATE: &str = "\
{name} {version}\n\
{about-with-newline}\n\
USAGE:\n    {usage}\n\
\nOPTIONS:\n{options}\n\
PIPELINE COMMANDS:\n{subcommands}\n";

fn long_help_footer() -> String {
    let mut footer = String::from(
        "Typical flow: inspect a new source file, run the pipeline for a date, then check status.\n\
         Exit codes: 0 success, 1 failure, 75 transient failure (retry later), 130 cancelled.\n\n\
         ENVIRONMENT:\n",
    );
    for line in ConfigLoader::env_var_documentation() {
        footer.push_str("    ");
        footer.push_str(line);
        footer.push('\n');
    }
    footer
}

#[derive(Parser)]
#[command(name = "covid-etl")]
#[command(version = crate::VERSION)]
#[command(about = "Extract, clean and load daily COVID case records into SQLite")]
#[command(help_template = HELP_TEMPLATE)]
#[command(after_long_help = long_help_footer())]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    #[command(
        about = "Run extract, transform and load for one logical date",
        long_about = "Run executes the whole graph in-process, retrying each stage per its policy, and records the run under the state directory.",
        after_help = "Example:\n    covid-etl run --date 2020-03-15"
    )]
    Run(RunArgs),
    #[command(
        about = "Run a single stage for an orchestrator",
        long_about = "Task runs one stage exactly once, handing data to the next task through the staging directory of the logical date. Exit code 75 marks a failure worth retrying.",
        after_help = "Examples:\n    covid-etl task extract --date 2020-03-15\n    covid-etl task cleanup --date 2020-03-15"
    )]
    Task(TaskArgs),
    #[command(
        about = "Export the task graph",
        long_about = "Graph prints the declared tasks with their dependencies, retries and timeouts, as JSON descriptors or Graphviz DOT.",
        after_help = "Example:\n    covid-etl graph --format dot | dot -Tpng > pipeline.png"
    )]
    Graph(GraphArgs),
    #[command(
        about = "Show recorded runs",
        long_about = "Status lists persisted run records newest first, or shows one run with its stage transitions and errors.",
        after_help = "Examples:\n    covid-etl status --date 2020-03-15\n    covid-etl status --run-id <RUN_ID> --format json"
    )]
    Status(StatusArgs),
    #[command(
        about = "Profile a source file without loading it",
        long_about = "Inspect extracts the source and reports blanks, regions, date span, duplicate keys and rows that would be dropped. The store is never touched.",
        after_help = "Example:\n    covid-etl inspect --source data/raw_data.csv --top 5"
    )]
    Inspect(InspectArgs),
}

impl Command {
    pub fn workspace(&self) -> &WorkspaceArgs {
        match self {
            Command::Run(args) => &args.workspace,
            Command::Task(args) => &args.workspace,
            Command::Graph(args) => &args.workspace,
            Command::Status(args) => &args.workspace,
            Command::Inspect(args) => &args.workspace,
        }
    }
}

/// Dispatch `args` and return the process exit code.
pub async fn run(args: Args, cancel: CancellationToken) -> crate::Result<i32> {
    match args.command {
        Command::Run(run_args) => commands::run(run_args, cancel).await,
        Command::Task(task_args) => commands::task(task_args, cancel).await,
        Command::Graph(graph_args) => commands::graph(graph_args),
        Command::Status(status_args) => commands::status(status_args),
        Command::Inspect(inspect_args) => commands::inspect(inspect_args).await,
    }
}
