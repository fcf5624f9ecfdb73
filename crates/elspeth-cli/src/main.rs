// crates/elspeth-cli/src/main.rs
// ============================================================================
// Module: Elspeth CLI Entry Point
// Description: Command dispatcher for pipeline runs and audited resume.
// Purpose: Provide the operator surface over the orchestration core.
// Dependencies: clap, elspeth-config, elspeth-core, elspeth-landscape-sqlite,
// elspeth-payload, elspeth-plugins
// ============================================================================

//! ## Overview
//! The CLI wires settings, the SQLite landscape, and the filesystem payload
//! store into the orchestrator. `resume` without `--execute` is a dry run
//! reporting the resume point; with `--execute` it reconstructs the
//! pipeline and continues from the audit trail. Exit codes: 0 success,
//! 1 configuration error, 2 runtime failure.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    reason = "The CLI's job is user-facing terminal output."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use elspeth_config::ConfigError;
use elspeth_config::load_settings;
use elspeth_core::NoopTelemetry;
use elspeth_core::Orchestrator;
use elspeth_core::OrchestratorError;
use elspeth_core::OrchestratorSettings;
use elspeth_core::RetryPolicy;
use elspeth_core::RunId;
use elspeth_core::RunStatus;
use elspeth_core::SystemClock;
use elspeth_landscape_sqlite::SqliteLandscape;
use elspeth_landscape_sqlite::SqliteLandscapeConfig;
use elspeth_payload::FsPayloadStore;
use elspeth_plugins::BuildError;
use elspeth_plugins::build_pipeline;

// ============================================================================
// SECTION: Arguments
// ============================================================================

/// Elspeth pipeline engine.
#[derive(Debug, Parser)]
#[command(name = "elspeth", version, about = "Audited row pipeline engine")]
struct Cli {
    /// Command to execute.
    #[command(subcommand)]
    command: Command,
}

/// CLI commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a full pipeline run.
    Run {
        /// Path to the pipeline settings YAML.
        #[arg(long)]
        config: PathBuf,
    },
    /// Inspect or continue a crashed run.
    Resume {
        /// Run identifier to resume.
        run_id: u64,
        /// Path to the pipeline settings YAML.
        #[arg(long)]
        config: PathBuf,
        /// Actually reprocess the unprocessed rows (default: dry run).
        #[arg(long)]
        execute: bool,
    },
    /// List recorded runs.
    ListRuns {
        /// Path to the pipeline settings YAML.
        #[arg(long)]
        config: PathBuf,
    },
}

// ============================================================================
// SECTION: Outcomes
// ============================================================================

/// CLI failure classification mapped onto exit codes.
#[derive(Debug)]
enum CliError {
    /// Configuration problem (exit code 1).
    Config(String),
    /// Runtime failure (exit code 2).
    Runtime(String),
}

impl From<ConfigError> for CliError {
    fn from(error: ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

impl From<BuildError> for CliError {
    fn from(error: BuildError) -> Self {
        Self::Config(error.to_string())
    }
}

impl From<OrchestratorError> for CliError {
    fn from(error: OrchestratorError) -> Self {
        match &error {
            OrchestratorError::RouteValidation(_) | OrchestratorError::Graph(_) => {
                Self::Config(error.to_string())
            }
            _ => Self::Runtime(error.to_string()),
        }
    }
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// Parses arguments, dispatches the command, and maps errors to exit codes.
fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Config(message)) => {
            eprintln!("configuration error: {message}");
            ExitCode::from(1)
        }
        Err(CliError::Runtime(message)) => {
            eprintln!("runtime failure: {message}");
            ExitCode::from(2)
        }
    }
}

/// Dispatches one parsed command.
fn dispatch(command: Command) -> Result<(), CliError> {
    match command {
        Command::Run {
            config,
        } => run_command(&config),
        Command::Resume {
            run_id,
            config,
            execute,
        } => resume_command(run_id, &config, execute),
        Command::ListRuns {
            config,
        } => list_runs_command(&config),
    }
}

/// Opens the stores declared in the settings.
fn open_stores(
    settings: &elspeth_config::PipelineSettings,
) -> Result<(SqliteLandscape, FsPayloadStore), CliError> {
    let landscape =
        SqliteLandscape::open(&SqliteLandscapeConfig::for_path(&settings.landscape.path))
            .map_err(|err| CliError::Runtime(err.to_string()))?;
    let payload = FsPayloadStore::open(&settings.payload.dir)
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    Ok((landscape, payload))
}

/// Builds the orchestrator settings from the settings document.
fn orchestrator_settings(settings: &elspeth_config::PipelineSettings) -> OrchestratorSettings {
    OrchestratorSettings {
        retry: RetryPolicy {
            max_attempts: settings.retry.max_attempts,
            base_delay_ms: settings.retry.base_delay_ms,
            max_delay_ms: settings.retry.max_delay_ms,
        },
        ..OrchestratorSettings::default()
    }
}

/// Executes a full pipeline run.
fn run_command(config: &PathBuf) -> Result<(), CliError> {
    let settings = load_settings(config)?;
    let pipeline = build_pipeline(&settings)?;
    let (landscape, payload) = open_stores(&settings)?;
    let telemetry = NoopTelemetry;
    let clock = SystemClock;
    let orchestrator = Orchestrator::new(
        &landscape,
        &payload,
        &telemetry,
        &clock,
        orchestrator_settings(&settings),
    );
    let report = orchestrator.run(pipeline)?;
    println!(
        "run {} {}: admitted={} quarantined={} written={} failed={}",
        report.run_id,
        status_label(report.status),
        report.counters.rows_admitted,
        report.counters.rows_quarantined,
        report.counters.tokens_written,
        report.counters.rows_failed,
    );
    for (sink, artifact) in &report.artifacts {
        println!("  sink {sink}: {}", artifact.uri);
    }
    if report.status == RunStatus::Failed {
        return Err(CliError::Runtime(format!(
            "run {} completed with failures; resume with: elspeth resume {} --execute",
            report.run_id, report.run_id
        )));
    }
    Ok(())
}

/// Inspects or continues a crashed run.
fn resume_command(run_id: u64, config: &PathBuf, execute: bool) -> Result<(), CliError> {
    let run_id = RunId::from_raw(run_id)
        .ok_or_else(|| CliError::Config("run id must be nonzero".to_string()))?;
    let settings = load_settings(config)?;
    let pipeline = build_pipeline(&settings)?;
    let (landscape, payload) = open_stores(&settings)?;
    let telemetry = NoopTelemetry;
    let clock = SystemClock;
    let orchestrator = Orchestrator::new(
        &landscape,
        &payload,
        &telemetry,
        &clock,
        orchestrator_settings(&settings),
    );
    if execute {
        let report = orchestrator.resume(run_id, pipeline)?;
        println!(
            "resume {} {}: reprocessed={} written={} failed={}",
            report.run_id,
            status_label(report.status),
            report.counters.rows_admitted,
            report.counters.tokens_written,
            report.counters.rows_failed,
        );
        Ok(())
    } else {
        let report = orchestrator.resume_report(run_id, &pipeline)?;
        println!(
            "resume point for run {}: unprocessed_rows={} checkpoints={} checkpoint_node={}",
            report.run_id,
            report.unprocessed_rows,
            report.checkpoint_count,
            report
                .checkpoint_node
                .map_or_else(|| "none".to_string(), |node| node.as_str().to_string()),
        );
        println!("re-run with --execute to reprocess");
        Ok(())
    }
}

/// Lists recorded runs.
fn list_runs_command(config: &PathBuf) -> Result<(), CliError> {
    let settings = load_settings(config)?;
    let (landscape, _payload) = open_stores(&settings)?;
    let runs = elspeth_core::Landscape::list_runs(&landscape)
        .map_err(|err| CliError::Runtime(err.to_string()))?;
    for run in runs {
        println!(
            "run {} started_at={} status={} config={}",
            run.run_id,
            run.started_at,
            status_label(run.status),
            run.config_hash,
        );
    }
    Ok(())
}

/// Returns the display label for a run status.
const fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}
