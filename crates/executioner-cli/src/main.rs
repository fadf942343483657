//! Command-line front end for the job execution engine (C14).

mod logging;

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;

use executioner_core::history::sqlite::SqliteHistoryStore;
use executioner_core::history::HistoryStore;
use executioner_core::notify::StdoutNotificationSink;
use executioner_core::{ConfigLoader, ExecutionOptions, Orchestrator, ResumeOptions, StateManager};

#[derive(Parser)]
#[command(name = "executioner")]
#[command(about = "Dependency-ordered job execution engine")]
#[command(version)]
struct Cli {
    /// Path to the pipeline configuration JSON
    #[arg(long, short = 'c', global = true, default_value = "pipeline.json")]
    config: PathBuf,

    /// Path to the SQLite history database
    #[arg(long, global = true, default_value = "executioner.db")]
    db: PathBuf,

    /// Directory to write per-job and master logs into
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the pipeline
    Run(RunArgs),

    /// Print the dispatch plan without running anything
    DryRun(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Keep dispatching independent jobs after a failure
    #[arg(long)]
    continue_on_error: bool,

    /// Job ids to skip unconditionally
    #[arg(long = "skip", value_delimiter = ',')]
    skip: Vec<String>,

    /// Resume a previous run_id, replaying its skip policy
    #[arg(long)]
    resume_from: Option<i64>,

    /// When resuming, only re-run jobs that previously failed
    #[arg(long)]
    resume_failed_only: bool,

    /// Force parallel dispatch regardless of the pipeline's own setting
    #[arg(long, conflicts_with = "sequential")]
    parallel: bool,

    /// Force sequential dispatch regardless of the pipeline's own setting
    #[arg(long)]
    sequential: bool,

    /// Override the pipeline's configured worker count
    #[arg(long)]
    workers: Option<i64>,

    /// Environment variable overrides, KEY=VALUE, may repeat
    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Working directory jobs are spawned from
    #[arg(long)]
    working_dir: Option<String>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_dir = cli.log_dir.clone();
    let _guard = logging::init(log_dir.as_deref());

    match real_main(cli) {
        Ok(exit_code) => ExitCode::from(exit_code as u8),
        Err(e) => {
            eprintln!("{} {e:#}", style("error:").red().bold());
            ExitCode::from(1)
        }
    }
}

fn real_main(cli: Cli) -> Result<i32> {
    let mut pipeline =
        ConfigLoader::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;

    let (args, dry_run) = match &cli.command {
        Commands::Run(args) => (args, false),
        Commands::DryRun(args) => (args, true),
    };

    if args.parallel {
        pipeline.parallel = true;
    }
    if args.sequential {
        pipeline.parallel = false;
    }
    if let Some(workers) = args.workers {
        pipeline.max_workers = workers;
    }

    let store = Arc::new(
        SqliteHistoryStore::open(&cli.db).with_context(|| format!("opening {}", cli.db.display()))?,
    ) as Arc<dyn HistoryStore>;
    let state = StateManager::new(store);

    let orchestrator = Orchestrator::new(pipeline, state)
        .with_notifier(Arc::new(StdoutNotificationSink));
    orchestrator.install_signal_handler().context("installing SIGINT handler")?;

    let options = ExecutionOptions {
        dry_run,
        continue_on_error: args.continue_on_error,
        cli_env: args.env.iter().cloned().collect(),
        resume: ResumeOptions {
            resume_from: args.resume_from,
            resume_failed_only: args.resume_failed_only,
            explicit_skip: args.skip.iter().cloned().collect::<HashSet<_>>(),
        },
        log_dir: cli.log_dir.clone(),
        working_dir: args.working_dir.clone(),
    };

    let report = orchestrator.run(&options)?;
    print_summary(&report, dry_run);

    let interrupted = orchestrator.interrupted_flag().load(std::sync::atomic::Ordering::SeqCst);
    if interrupted && dry_run {
        return Ok(0);
    }
    Ok(report.exit_code)
}

fn print_summary(report: &executioner_core::RunReport, dry_run: bool) {
    println!();
    if dry_run {
        println!("{}", style("dispatch plan").bold());
        for id in &report.dispatch_order {
            if report.skipped.contains(id) {
                println!("  {} {id} (skip)", style("-").dim());
            } else {
                println!("  {} {id}", style("-").cyan());
            }
        }
        return;
    }

    println!("{}", style(format!("run {} attempt {}: {}", report.run_id, report.attempt_id, report.status)).bold());
    println!("  completed: {}", report.completed.len());
    if !report.failed.is_empty() {
        println!("{}", style("  failed:").red());
        for (id, reason) in &report.failed {
            println!("    {id}: {}", reason.as_deref().unwrap_or("no reason recorded"));
        }
        println!();
        println!(
            "  resume with: executioner run --resume-from {} --resume-failed-only",
            report.run_id
        );
    }
    if !report.skipped.is_empty() {
        println!("  skipped: {}", report.skipped.join(", "));
    }
}
