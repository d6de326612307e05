//! Command-line entry point: parses a pipeline document and runs it
//! through the stage scheduler to completion.

mod scheduler;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use flowctl_core::{FlowContext, Stages, Variables};
use flowctl_sql::SqlAdapter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};

/// Reload handle the scheduler uses to apply a stage's `log_level` to the
/// global filter for that stage and every stage after it.
pub type LogFilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

const DEMO_PIPELINE: &str = include_str!("../demo.yaml");

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Csv,
    Parquet,
    Json,
    Excel,
}

#[derive(Parser, Debug)]
#[command(name = "flowctl", about = "Declarative data-pipeline engine")]
struct Args {
    /// Path to a pipeline YAML document, raw YAML text, or the literal
    /// `DEMO` to run the built-in demonstration pipeline.
    pipeline: String,

    /// Context entries as KEY=VAL, repeatable.
    #[arg(short = 'c', long = "context", value_parser = parse_kv)]
    context: Vec<(String, String)>,

    /// Variable entries as KEY=VAL, repeatable.
    #[arg(short = 'v', long = "variable", value_parser = parse_kv)]
    variable: Vec<(String, String)>,

    #[arg(short = 'l', long = "logfile")]
    logfile: Option<PathBuf>,

    #[arg(long)]
    verbose: bool,

    /// Final sink for the last stage's output: `-o parquet:out/result.parquet`.
    #[arg(short = 'o', long = "output", value_parser = parse_output)]
    output: Option<(OutputFormat, PathBuf)>,
}

fn parse_kv(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VAL, got '{s}'"))
}

fn parse_output(s: &str) -> Result<(OutputFormat, PathBuf), String> {
    let (fmt, path) = s.split_once(':').ok_or_else(|| format!("expected FORMAT:PATH, got '{s}'"))?;
    let format = match fmt {
        "csv" => OutputFormat::Csv,
        "parquet" => OutputFormat::Parquet,
        "json" => OutputFormat::Json,
        "excel" => OutputFormat::Excel,
        other => return Err(format!("unknown output format '{other}'")),
    };
    Ok((format, PathBuf::from(path)))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let filter_handle = init_logging(args.verbose, args.logfile.as_ref());

    match run(&args, filter_handle).await {
        Ok(()) => ExitCode::from(0),
        Err(CliError::FlowRun(e)) => {
            tracing::error!(error = %e, "pipeline run failed");
            ExitCode::from(1)
        }
        Err(CliError::Output(e)) => {
            tracing::error!(error = %e, "output write failed");
            ExitCode::from(2)
        }
    }
}

enum CliError {
    FlowRun(flowctl_core::FlowError),
    Output(flowctl_core::FlowError),
}

async fn run(args: &Args, filter_handle: LogFilterHandle) -> Result<(), CliError> {
    let source = if args.pipeline == "DEMO" { DEMO_PIPELINE } else { &args.pipeline };
    let stages = Stages::load(source).map_err(CliError::FlowRun)?;

    let mut context = FlowContext::default();
    for (k, v) in &args.context {
        context.insert(k.clone(), serde_json::Value::String(v.clone()));
    }
    let mut variables = Variables::default();
    for (k, v) in &args.variable {
        variables.insert(k.clone(), serde_json::Value::String(v.clone()));
    }

    let sql = SqlAdapter::connect(false).await.map_err(CliError::FlowRun)?;
    let mut sched = scheduler::Scheduler::new(&sql, context, variables, true, filter_handle);
    sched.run(&stages).await.map_err(CliError::FlowRun)?;

    if let Some((format, path)) = &args.output {
        write_output(&sql, &sched, *format, path).await.map_err(CliError::Output)?;
    }

    Ok(())
}

async fn write_output(
    sql: &SqlAdapter,
    sched: &scheduler::Scheduler<'_>,
    format: OutputFormat,
    path: &PathBuf,
) -> flowctl_core::Result<()> {
    let lastname = sched
        .lastname()
        .ok_or_else(|| flowctl_core::FlowError::Configuration("no stage output to write".into()))?;

    let path_str = path.to_string_lossy();
    let statement = match format {
        OutputFormat::Csv => {
            format!("COPY (SELECT * FROM \"{lastname}\") TO '{path_str}' (FORMAT CSV, HEADER true)")
        }
        OutputFormat::Parquet => {
            format!("COPY (SELECT * FROM \"{lastname}\") TO '{path_str}' (FORMAT PARQUET)")
        }
        OutputFormat::Json => {
            format!("COPY (SELECT * FROM \"{lastname}\") TO '{path_str}' (FORMAT JSON)")
        }
        OutputFormat::Excel => {
            return Err(flowctl_core::FlowError::Configuration(
                "excel output is not implemented: no xlsx-writer crate in this stack".into(),
            ));
        }
    };
    sql.sql(&statement).await?;
    Ok(())
}

/// Builds the global subscriber around a [`reload::Layer`] so a stage's
/// `log_level` can later replace the active `EnvFilter` without tearing
/// down and re-installing the subscriber.
fn init_logging(verbose: bool, logfile: Option<&PathBuf>) -> LogFilterHandle {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let (filter, handle) = reload::Layer::new(filter);

    match logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .expect("failed to open --logfile path");
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::sync::Mutex::new(file)))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
    handle
}
