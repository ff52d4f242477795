#![warn(missing_docs)]
//! isorun CLI Library
//!
//! Timeout supervision, executor policies, configuration and the `isorun`
//! command-line front end. The binary times an external command as the
//! measurement function, once per submission, each run in its own forked
//! worker that is killed if it overruns.
//!
//! # Example
//!
//! ```ignore
//! use isorun_cli::{Executor, ExecutorConfig};
//! use isorun_core::{Args, DeviceContext};
//! use std::time::Duration;
//!
//! let executor = Executor::new(ExecutorConfig::new(Duration::from_secs(5)))?;
//! let mut future = executor.submit(
//!     |_: &DeviceContext, _: &Args| Ok(42),
//!     "llvm",
//!     Args::new(),
//! )?;
//! assert_eq!(future.get(None)?.value(), Some(&42));
//! ```

mod config;
mod executor;
mod process_tree;
mod supervisor;

pub use config::*;
pub use executor::{
    Executor, ExecutorConfig, ExecutorError, Policy, RunRecord, RunReport, RunSummary,
    build_report, format_human_output,
};
pub use process_tree::ProcessTree;
pub use supervisor::*;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use isorun_core::{Args, DeviceContext, FailureKind, Outcome, TaskError};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Instant;

/// isorun CLI arguments
#[derive(Parser, Debug)]
#[command(name = "isorun")]
#[command(
    author,
    version,
    about = "isorun - run commands in isolated, deadline-bounded worker processes"
)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Optional subcommand; without one the trailing command is run
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Target descriptor resolved inside each worker (e.g. "llvm -device_id=0")
    #[arg(long, default_value = "llvm")]
    pub target: String,

    /// Per-run timeout (e.g. "10s", "500ms"); overrides isorun.toml
    #[arg(long)]
    pub timeout: Option<String>,

    /// Submission policy; overrides isorun.toml
    #[arg(long, value_parser = ["pooled", "single-flight"])]
    pub policy: Option<String>,

    /// Supervisor threads for the pooled policy
    #[arg(long, short = 'j')]
    pub jobs: Option<usize>,

    /// Number of times to run the command
    #[arg(long, short = 'n', default_value = "1")]
    pub repeat: usize,

    /// Run in forked worker processes (default: true)
    /// Use --isolated=false to run in-process without a deadline
    #[arg(long, action = clap::ArgAction::Set)]
    pub isolated: Option<bool>,

    /// Output format: human, json
    #[arg(long, value_parser = ["human", "json"])]
    pub format: Option<String>,

    /// Output file (stdout if not specified)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to time, after `--`
    #[arg(last = true, value_name = "COMMAND")]
    pub cmd: Vec<String>,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print a default isorun.toml
    Init,
}

/// Run the isorun CLI with the process arguments.
///
/// # Returns
/// Returns `Ok(())` on success, or an error if something goes wrong.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_with_cli(cli)
}

/// Run the isorun CLI with pre-parsed arguments.
pub fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Some(Commands::Init) = cli.command {
        print!("{}", FileConfig::default_toml());
        return Ok(());
    }

    // Initialize logging; stderr keeps JSON output on stdout clean
    let filter = if cli.verbose {
        "isorun=debug"
    } else {
        "isorun=info"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    // Discover isorun.toml configuration (CLI flags override)
    let file_config = FileConfig::discover().unwrap_or_default();
    let config = resolve_config(&cli, &file_config)?;
    let format = cli
        .format
        .clone()
        .unwrap_or_else(|| file_config.output.format.clone());

    if cli.cmd.is_empty() {
        anyhow::bail!("no command given; usage: isorun [OPTIONS] -- <COMMAND>...");
    }
    if cli.repeat == 0 {
        anyhow::bail!("--repeat must be at least 1");
    }

    let started = Instant::now();
    let runs = run_command(&cli, &config, format == "human")?;
    tracing::info!(
        runs = runs.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "all runs finished"
    );

    let policy = match config.policy {
        Policy::Pooled { .. } => "pooled",
        Policy::SingleFlight => "single-flight",
    };
    let report = build_report(
        &cli.cmd,
        &cli.target,
        config.timeout.as_millis() as u64,
        policy,
        config.isolation.is_isolated(),
        runs,
    );

    let rendered = match format.as_str() {
        "json" => serde_json::to_string_pretty(&report)?,
        _ => format_human_output(&report),
    };
    match &cli.output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "report written");
        }
        None => println!("{}", rendered),
    }

    if !report.summary.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

/// Merge command-line overrides into the file configuration
fn resolve_config(cli: &Cli, file_config: &FileConfig) -> anyhow::Result<ExecutorConfig> {
    let mut merged = file_config.clone();
    if let Some(timeout) = &cli.timeout {
        merged.executor.timeout = timeout.clone();
    }
    if let Some(policy) = &cli.policy {
        merged.executor.policy = match policy.as_str() {
            "single-flight" => PolicyKind::SingleFlight,
            _ => PolicyKind::Pooled,
        };
    }
    if let Some(jobs) = cli.jobs {
        merged.executor.pool_size = Some(jobs);
    }
    if let Some(isolated) = cli.isolated {
        merged.executor.isolation = if isolated {
            IsolationMode::Process
        } else {
            IsolationMode::InProcess
        };
    }
    merged.executor_config()
}

/// Submit the command `cli.repeat` times and collect every outcome
fn run_command(
    cli: &Cli,
    config: &ExecutorConfig,
    show_progress: bool,
) -> anyhow::Result<Vec<RunRecord>> {
    let executor = Executor::new(config.clone())?;
    let args = cli
        .cmd
        .iter()
        .fold(Args::new(), |args, word| args.arg(word.as_str()));

    let pb = if show_progress {
        let pb = ProgressBar::new(cli.repeat as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    } else {
        ProgressBar::hidden()
    };
    pb.set_message(cli.cmd.join(" "));

    let mut pending = Vec::with_capacity(cli.repeat);
    for run in 1..=cli.repeat {
        let mut future = executor.submit(time_command, cli.target.as_str(), args.clone())?;
        // Single-flight and in-process futures are resolved on return
        let counted = future.done();
        if counted {
            pb.inc(1);
        }
        pending.push((run, future, counted));
    }

    let mut runs = Vec::with_capacity(pending.len());
    for (run, future, counted) in pending {
        let task_id = future.task_id();
        let outcome = future.into_outcome(None).unwrap_or_else(|e| {
            Outcome::Failure(TaskError::new(FailureKind::Protocol, e.to_string()))
        });
        if !counted {
            pb.inc(1);
        }
        runs.push(RunRecord {
            run,
            task_id,
            outcome,
        });
    }
    pb.finish_and_clear();

    Ok(runs)
}

/// Measurement function: run the command, return elapsed seconds.
///
/// The command sees the resolved device in `ISORUN_DEVICE` as `kind:index`.
fn time_command(ctx: &DeviceContext, args: &Args) -> anyhow::Result<f64> {
    let argv = args
        .positional()
        .iter()
        .map(|v| v.as_str().context("command words must be strings"))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let (program, rest) = argv.split_first().context("empty command")?;

    let started = Instant::now();
    let status = Command::new(program)
        .args(rest)
        .env("ISORUN_DEVICE", format!("{}:{}", ctx.kind, ctx.index))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .status()
        .with_context(|| format!("failed to start '{}'", program))?;
    let elapsed = started.elapsed().as_secs_f64();

    if !status.success() {
        anyhow::bail!("'{}' failed with {}", program, status);
    }
    Ok(elapsed)
}
