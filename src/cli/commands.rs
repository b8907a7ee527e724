//! CLI command definitions and handlers for stepforge.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use crate::error::OrchestratorError;
use crate::observability::{init_logging, LogRouter};
use crate::pipeline::{load_manifest, Orchestrator, OrchestratorConfig, RunOutcome, RunRequest};
use crate::state::{generate_run_id, RunDetail, RunLayout, RunState, RunSummary, StateStore};

/// Checkpointed, resumable pipeline runner.
#[derive(Parser)]
#[command(name = "stepforge")]
#[command(about = "Run multi-step pipelines with checkpoints, resume and per-run reports")]
#[command(version)]
#[command(
    long_about = "stepforge runs pipeline kinds declared in a YAML manifest as ordered lists of \
steps. Every step result is checkpointed under the output directory so a failed run can be \
resumed from the step that stopped it."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (error, warn, info, debug, trace). RUST_LOG takes precedence.
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Directory holding one sub-directory per run.
    #[arg(short, long, global = true, env = "PIPELINE_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Pipeline manifest to load pipeline kinds from.
    #[arg(short, long, global = true, env = "PIPELINE_MANIFEST")]
    pub manifest: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new run of a pipeline kind, or resume an existing one.
    #[command(alias = "r")]
    Run(RunArgs),

    /// List all runs, newest first.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Show one run with per-step status, timing and cost.
    Show(ShowArgs),

    /// Delete old run directories.
    Cleanup(CleanupArgs),

    /// Describe the pipeline kinds in the manifest: parameters and steps.
    Kinds,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Pipeline kind to run.
    pub kind: String,

    /// Run parameter as key=value. Repeatable.
    #[arg(short, long = "param", value_parser = parse_key_val)]
    pub params: Vec<(String, String)>,

    /// Resume the given run from its first unfinished step.
    #[arg(long, value_name = "RUN_ID")]
    pub resume: Option<String>,

    /// Simulate every step without invoking executors.
    #[arg(long)]
    pub dry_run: bool,

    /// Mark a step as skipped instead of running it. Repeatable.
    #[arg(long = "skip", value_name = "STEP")]
    pub skip: Vec<String>,

    /// Re-run completed steps and reprocess finished batch items.
    #[arg(long)]
    pub force: bool,

    /// Seconds to wait for the dependency before a gated step.
    #[arg(long, value_name = "SECS")]
    pub dependency_timeout: Option<u64>,
}

#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Print runs as JSON.
    #[arg(short, long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Run to show.
    pub run_id: String,

    /// Print the run as JSON.
    #[arg(short, long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct CleanupArgs {
    /// Delete runs started more than this many days ago.
    #[arg(long, default_value = "30")]
    pub max_age_days: u32,

    /// Keep completed runs regardless of age.
    #[arg(long)]
    pub keep_successful: bool,
}

/// Parses a `key=value` pair for `--param`.
fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses arguments, installs logging and runs the command.
///
/// For control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    let cli = parse_cli();
    let router = init_logging(&cli.log_level);
    run_with_cli(cli, router).await
}

/// Run the CLI with the parsed arguments.
///
/// `router` receives per-run log files; pass a fresh `LogRouter` when no
/// run-log layer is installed.
pub async fn run_with_cli(cli: Cli, router: LogRouter) -> anyhow::Result<()> {
    let config = build_config(&cli)?;
    match cli.command {
        Commands::Run(args) => run_pipeline_command(config, router, args).await,
        Commands::List(args) => run_list_command(&config, args).await,
        Commands::Show(args) => run_show_command(&config, args).await,
        Commands::Cleanup(args) => run_cleanup_command(&config, args).await,
        Commands::Kinds => run_kinds_command(&config).await,
    }
}

fn build_config(cli: &Cli) -> anyhow::Result<OrchestratorConfig> {
    let mut config = OrchestratorConfig::from_env()?;
    if let Some(dir) = &cli.output_dir {
        config = config.with_output_dir(dir);
    }
    if let Some(path) = &cli.manifest {
        config = config.with_manifest_path(path);
    }
    config.validate()?;
    Ok(config)
}

async fn load_orchestrator(
    config: OrchestratorConfig,
    router: LogRouter,
) -> anyhow::Result<Orchestrator> {
    let registry = load_manifest(&config.manifest_path, config.health_request_timeout)
        .await
        .with_context(|| format!("Failed to load manifest {}", config.manifest_path.display()))?;
    debug!(
        manifest = %config.manifest_path.display(),
        kinds = registry.kinds().count(),
        "Loaded manifest"
    );
    Ok(Orchestrator::new(config, registry).with_log_router(router))
}

// ============================================================================
// run
// ============================================================================

async fn run_pipeline_command(
    config: OrchestratorConfig,
    router: LogRouter,
    args: RunArgs,
) -> anyhow::Result<()> {
    let orchestrator = load_orchestrator(config, router).await?;

    let parameters: BTreeMap<String, String> = args.params.into_iter().collect();
    let mut request = RunRequest::new(&args.kind)
        .with_params(parameters)
        .dry_run(args.dry_run)
        .force(args.force);
    // Known up front so the checkpoint can be reported even when the attempt errors.
    let run_id = match &args.resume {
        Some(run_id) => {
            request = request.resume(run_id);
            run_id.clone()
        }
        None => {
            let run_id = generate_run_id();
            request = request.with_run_id(&run_id);
            run_id
        }
    };
    for step in &args.skip {
        request = request.skip(step);
    }
    if let Some(secs) = args.dependency_timeout {
        request = request.with_dependency_timeout(Duration::from_secs(secs));
    }

    info!(
        kind = %args.kind,
        run_id = %run_id,
        resume = ?args.resume,
        dry_run = args.dry_run,
        "Starting run"
    );
    let outcome = match orchestrator.run(request).await {
        Ok(outcome) => outcome,
        Err(err) => {
            // These happen after the run started, so a checkpoint may exist.
            if matches!(err, OrchestratorError::State(_) | OrchestratorError::Unexpected(_)) {
                report_stored_run(orchestrator.store(), &run_id).await;
            }
            return Err(anyhow::Error::new(err).context(format!("Run {} failed", run_id)));
        }
    };
    print_outcome(&outcome);

    match outcome.failure {
        None => Ok(()),
        Some(err) => Err(anyhow::Error::new(err).context(format!(
            "Run {} failed; resume with: stepforge run {} --resume {}",
            outcome.state.run_id, outcome.state.pipeline_kind, outcome.state.run_id
        ))),
    }
}

fn print_outcome(outcome: &RunOutcome) {
    print_run_summary(
        &outcome.state,
        &outcome.layout,
        &outcome.executed,
        &outcome.skipped,
        outcome.is_success(),
    );
}

/// Prints the persisted summary of a run whose attempt ended in an error.
/// Returns false when the run has no readable checkpoint.
async fn report_stored_run(store: &StateStore, run_id: &str) -> bool {
    match store.load(run_id).await {
        Ok(state) => {
            print_run_summary(&state, &store.layout(run_id), &[], &[], false);
            true
        }
        Err(e) => {
            debug!(run_id = %run_id, error = %e, "No checkpoint to summarize");
            false
        }
    }
}

fn print_run_summary(
    state: &RunState,
    layout: &RunLayout,
    executed: &[String],
    skipped: &[String],
    success: bool,
) {
    let icon = if success { "✅" } else { "❌" };

    println!();
    println!("{} Run {} ({}): {}", icon, state.run_id, state.pipeline_kind, state.status);
    if !executed.is_empty() {
        println!("   Executed: {}", executed.join(", "));
    }
    if !skipped.is_empty() {
        println!("   Skipped:  {}", skipped.join(", "));
    }
    println!(
        "   Steps completed: {}   Cost: ${:.4}   Tokens: {} (in {}, out {})",
        state.completed_count(),
        state.total_cost,
        state.total_tokens,
        state.total_input_tokens,
        state.total_output_tokens
    );
    if !state.identifiers.is_empty() {
        let ids: Vec<String> = state
            .identifiers
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!("   Identifiers: {}", ids.join(", "));
    }
    if let Some(error) = &state.error {
        println!("   Error: {}", error);
    }
    if let Some(next) = &state.next_step {
        if !success {
            println!("   Next step on resume: {}", next);
        }
    }
    println!("\n📁 Checkpoint: {}", layout.checkpoint().display());
    println!("📁 Reports:    {}", layout.reports_dir().display());
    println!("📁 Logs:       {}", layout.logs_dir().display());
}

// ============================================================================
// list / show / cleanup
// ============================================================================

async fn run_list_command(config: &OrchestratorConfig, args: ListArgs) -> anyhow::Result<()> {
    let store = StateStore::new(&config.output_dir);
    let runs = store.list_runs().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No runs found in {}", config.output_dir.display());
        return Ok(());
    }

    println!(
        "{:<22} {:<16} {:<12} {:>10}  PARAMETERS",
        "RUN ID", "KIND", "STATUS", "COST"
    );
    for run in &runs {
        println!("{}", format_summary_row(run));
    }
    Ok(())
}

fn format_summary_row(run: &RunSummary) -> String {
    let params: Vec<String> = run
        .parameters
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    format!(
        "{:<22} {:<16} {:<12} {:>10}  {}",
        run.run_id,
        run.pipeline_kind,
        run.status.to_string(),
        format!("${:.4}", run.total_cost),
        params.join(" ")
    )
}

async fn run_show_command(config: &OrchestratorConfig, args: ShowArgs) -> anyhow::Result<()> {
    let store = StateStore::new(&config.output_dir);
    let detail = store
        .get_run_details(&args.run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("No run '{}' in {}", args.run_id, config.output_dir.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
    } else {
        print_detail(&detail, &store.layout(&args.run_id).checkpoint());
    }
    Ok(())
}

fn print_detail(detail: &RunDetail, checkpoint: &Path) {
    let run = &detail.summary;
    println!("Run:        {}", run.run_id);
    println!("Kind:       {}", run.pipeline_kind);
    println!("Status:     {}", run.status);
    println!("Started:    {}", run.started_at.to_rfc3339());
    println!("Updated:    {}", run.updated_at.to_rfc3339());
    println!("Duration:   {:.1}s", detail.total_duration_seconds);
    println!("Cost:       ${:.4}", run.total_cost);
    println!("Tokens:     {}", run.total_tokens);
    for (key, value) in &run.parameters {
        println!("Param:      {}={}", key, value);
    }
    for (key, value) in &detail.identifiers {
        println!("Identifier: {}={}", key, value);
    }
    if let Some(next) = &run.next_step {
        println!("Next step:  {}", next);
    }
    if let Some(error) = &run.error {
        println!("Error:      {}", error);
    }

    println!();
    println!("{:<24} {:<12} {:>9} {:>10} {:>8}", "STEP", "STATUS", "DURATION", "COST", "TOKENS");
    for step in &detail.steps {
        let duration = step
            .duration_seconds
            .map(|d| format!("{:.1}s", d))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<12} {:>9} {:>10} {:>8}",
            step.name,
            step.status.to_string(),
            duration,
            format!("${:.4}", step.cost),
            step.tokens
        );
        if let Some(error) = &step.error {
            println!("    error: {}", error);
        }
    }
    println!("\n📁 {}", checkpoint.display());
}

async fn run_cleanup_command(config: &OrchestratorConfig, args: CleanupArgs) -> anyhow::Result<()> {
    let store = StateStore::new(&config.output_dir);
    let max_age = chrono::Duration::days(i64::from(args.max_age_days));
    let removed = store.cleanup_old_runs(max_age, args.keep_successful).await?;
    println!(
        "Removed {} run(s) older than {} day(s){}",
        removed,
        args.max_age_days,
        if args.keep_successful { ", kept completed runs" } else { "" }
    );
    Ok(())
}

// ============================================================================
// kinds
// ============================================================================

async fn run_kinds_command(config: &OrchestratorConfig) -> anyhow::Result<()> {
    let orchestrator = load_orchestrator(config.clone(), LogRouter::new()).await?;
    let registry = orchestrator.registry();

    if registry.is_empty() {
        println!("No pipeline kinds in {}", config.manifest_path.display());
        return Ok(());
    }

    if let Some(gate) = registry.dependency() {
        println!("Dependency: {} ({})", gate.name(), gate.health_url());
        println!();
    }

    for pipeline in registry.pipelines() {
        println!("{}", pipeline.kind);
        if !pipeline.description.is_empty() {
            println!("  {}", pipeline.description);
        }
        let params: Vec<String> = pipeline
            .params
            .iter()
            .map(|p| format!("--param {}=<value>", p))
            .collect();
        if params.is_empty() {
            println!("  parameters: none");
        } else {
            println!("  parameters: {}", params.join(" "));
        }
        println!("  steps:");
        for (idx, step) in pipeline.steps().iter().enumerate() {
            let mut flags = vec![step.executor().strategy().to_string()];
            if step.requires_dependency {
                flags.push("gated".to_string());
            }
            if !step.requires.is_empty() {
                flags.push(format!("requires {}", step.requires.join(",")));
            }
            if !step.produces.is_empty() {
                flags.push(format!("produces {}", step.produces.join(",")));
            }
            println!("    {}. {} [{}]", idx + 1, step.name, flags.join("; "));
            if !step.description.is_empty() {
                println!("       {}", step.description);
            }
        }
        println!();
    }
    Ok(())
}
