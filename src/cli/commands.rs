use crate::{
    cli::args::{
        GraphArgs, GraphFormat, InspectArgs, RunArgs, StatusArgs, TaskArgs, TaskName,
        WorkspaceArgs,
    },
    core::{
        config::{ConfigLoader, ConfigValidator, CovidEtlConfig},
        extract::Extractor,
        inspect,
        load::ScopeMode,
        pipeline_graph::{
            dot::{graph_descriptor, graph_to_dot},
            execute_cleanup, execute_run, execute_task,
            history::{list_runs, load_run},
            standard_registry, PipelineGraph, PipelineSettings, RunOptions, RunRecord, StageId,
        },
        transform::Transformer,
        types::OutputFormat,
    },
    Result,
};
use anyhow::{anyhow, Context};
use chrono::{NaiveDate, Utc};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything a pipeline command needs once config has been resolved.
struct Prepared {
    settings: PipelineSettings,
    graph: PipelineGraph,
    state_dir: PathBuf,
}

fn load_config(workspace: &WorkspaceArgs) -> Result<CovidEtlConfig> {
    let config = ConfigLoader::load(&workspace.path, workspace.config.as_deref())?;
    Ok(config)
}

/// Relative paths in the config are anchored at the workspace.
fn resolve_path(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

fn resolve_store_url(workspace: &Path, url: &str) -> String {
    match url.strip_prefix("sqlite://") {
        Some(rest) if !rest.starts_with(":memory:") && !Path::new(rest).is_absolute() => {
            format!("sqlite://{}", workspace.join(rest).display())
        }
        _ => url.to_string(),
    }
}

fn prepare(config: &CovidEtlConfig, workspace: &Path) -> Result<Prepared> {
    ConfigValidator::validate(config)?;
    let mut settings = config.pipeline_settings()?;
    settings.source_path = resolve_path(workspace, &settings.source_path);
    settings.store.url = resolve_store_url(workspace, &settings.store.url);
    Ok(Prepared {
        settings,
        graph: config.pipeline_graph()?,
        state_dir: resolve_path(workspace, &config.run.state_dir),
    })
}

pub async fn run(args: RunArgs, cancel: CancellationToken) -> Result<i32> {
    let mut config = load_config(&args.workspace)?;
    if let Some(source) = &args.source {
        config.source.path = source.clone();
    }
    if let Some(url) = &args.store_url {
        config.store.url = url.clone();
    }
    if let Some(scope) = &args.scope {
        config.load.scope = scope.parse::<ScopeMode>().map_err(|e| anyhow!(e))?;
    }
    let prepared = prepare(&config, &args.workspace.path)?;

    let logical_date = args.date.unwrap_or_else(|| Utc::now().date_naive());
    let registry = standard_registry(&prepared.settings);
    let options = RunOptions::new(logical_date, prepared.state_dir).with_cancel(cancel);
    let record = execute_run(&prepared.graph, &registry, &options).await?;

    print_record(&record, args.format)?;
    Ok(record.exit_code())
}

pub async fn task(args: TaskArgs, cancel: CancellationToken) -> Result<i32> {
    let config = load_config(&args.workspace)?;
    let prepared = prepare(&config, &args.workspace.path)?;
    let options = RunOptions::new(args.date, prepared.state_dir).with_cancel(cancel);

    let record = match args.task {
        TaskName::Cleanup => execute_cleanup(&options)?,
        TaskName::Extract | TaskName::Transform | TaskName::Load => {
            let stage: StageId = args.task.to_string().parse()?;
            let registry = standard_registry(&prepared.settings);
            execute_task(&prepared.graph, &registry, stage, &options).await?
        }
    };

    print_record(&record, args.format)?;
    Ok(record.exit_code())
}

pub fn graph(args: GraphArgs) -> Result<i32> {
    let config = load_config(&args.workspace)?;
    ConfigValidator::validate(&config)?;
    let graph = config.pipeline_graph()?;
    match args.format {
        GraphFormat::Dot => print!("{}", graph_to_dot(&graph)),
        GraphFormat::Json => {
            let descriptor = graph_descriptor(&graph);
            println!("{}", serde_json::to_string_pretty(&descriptor)?)
        }
    }
    Ok(0)
}

pub fn status(args: StatusArgs) -> Result<i32> {
    let config = load_config(&args.workspace)?;
    let state_dir = resolve_path(&args.workspace.path, &config.run.state_dir);

    if let Some(run_id) = &args.run_id {
        let run_id =
            Uuid::parse_str(run_id).with_context(|| format!("invalid run id '{}'", run_id))?;
        let record = load_run(&state_dir, &run_id)?;
        match args.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
            OutputFormat::Text => print!("{}", render_run_detail(&record)),
        }
        return Ok(0);
    }

    let records = list_runs(&state_dir, args.date, Some(args.limit))?;
    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Text => print!("{}", render_run_list(&records, args.date)),
    }
    Ok(0)
}

pub async fn inspect(args: InspectArgs) -> Result<i32> {
    let mut config = load_config(&args.workspace)?;
    if let Some(source) = &args.source {
        config.source.path = source.clone();
    }
    let settings = prepare(&config, &args.workspace.path)?.settings;

    let extractor = Extractor::new(settings.schema.clone(), settings.extract.clone());
    let extraction = extractor.extract_path(&settings.source_path).await?;
    let transformer = Transformer::new(settings.schema, settings.transform);
    let profile = inspect::profile(&extraction, &transformer, args.top);

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&profile)?),
        OutputFormat::Text => print!("{}", inspect::render_text(&profile)),
    }
    Ok(0)
}

fn print_record(record: &RunRecord, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(record)?),
        OutputFormat::Text => print!("{}", render_run_summary(record)),
    }
    Ok(())
}

fn render_run_summary(record: &RunRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Run {} ({}) for {}: {}",
        record.run_id, record.kind, record.logical_date, record.status
    );
    for stage in &record.stages {
        let _ = write!(
            out,
            "  {:<10} {:<16} attempts={}",
            stage.stage.as_str(),
            stage.state.as_str(),
            stage.attempts
        );
        if let Some(error) = stage.last_error() {
            let _ = write!(out, "  [{}] {}", error.code, error.message);
        }
        out.push('\n');
    }
    let c = &record.counters;
    let _ = writeln!(
        out,
        "Rows: extracted={} dropped={} deduplicated={} loaded={} deleted={}",
        c.rows_extracted, c.rows_dropped, c.rows_deduplicated, c.rows_loaded, c.rows_deleted
    );
    out
}

fn render_run_detail(record: &RunRecord) -> String {
    let mut out = render_run_summary(record);
    let _ = writeln!(out, "Started: {}", record.started_at.to_rfc3339());
    if let Some(completed) = record.completed_at {
        let _ = writeln!(out, "Completed: {}", completed.to_rfc3339());
    }
    if let Some(sha) = &record.source_sha256 {
        let _ = writeln!(out, "Source SHA-256: {}", sha);
    }
    for stage in &record.stages {
        if stage.transitions.is_empty() && stage.attempt_errors.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n{}:", stage.stage);
        for transition in &stage.transitions {
            let _ = writeln!(
                out,
                "  {} {} -> {}",
                transition.at.format("%H:%M:%S%.3f"),
                transition.from,
                transition.to
            );
        }
        for (attempt, error) in stage.attempt_errors.iter().enumerate() {
            let retry = if error.retryable { "transient" } else { "terminal" };
            let _ = writeln!(
                out,
                "  error #{} [{}] {} ({}): {}",
                attempt + 1,
                error.code,
                error.category,
                retry,
                error.message
            );
            for (key, value) in &error.context {
                let _ = writeln!(out, "      {}: {}", key, value);
            }
        }
    }
    out
}

fn render_run_list(records: &[RunRecord], date: Option<NaiveDate>) -> String {
    let mut out = String::new();
    if records.is_empty() {
        match date {
            Some(date) => {
                let _ = writeln!(out, "No runs recorded for {}", date);
            }
            None => {
                let _ = writeln!(out, "No runs recorded");
            }
        }
        return out;
    }
    let _ = writeln!(
        out,
        "{:<36}  {:<16}  {:<10}  {:<10}  STARTED",
        "RUN_ID", "KIND", "DATE", "STATUS"
    );
    for record in records {
        let _ = writeln!(
            out,
            "{:<36}  {:<16}  {:<10}  {:<10}  {}",
            record.run_id,
            record.kind.to_string(),
            record.logical_date,
            record.status.as_str(),
            record.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    out
}
