//! Drover CLI - batch harness for autonomous agent runs

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use drover::batch::{default_output_dir, RUN_LOG};
use drover::error::{DroverError, FixSuggestion};
use drover::{
    load_manifest, merge_predictions, CommandExecutor, RunBatch, RunBatchConfig, PREDS_FILE,
};

#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Drover - batch harness for autonomous agent runs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch of instances
    Run {
        /// Instance manifest (.jsonl with one instance per line, or .yaml)
        manifest: PathBuf,

        /// Shell command that runs the agent for one instance
        #[arg(long)]
        agent_cmd: String,

        /// Output directory (defaults to trajectories/<manifest-stem>)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Suffix appended to the default output directory name
        #[arg(long, default_value = "")]
        suffix: String,

        /// Number of concurrent workers
        #[arg(short, long, default_value_t = 1)]
        workers: usize,

        /// Re-run instances that already have a valid trajectory
        #[arg(long)]
        redo_existing: bool,

        /// Re-raise the first error instead of containing it
        #[arg(long)]
        strict: bool,

        /// Suppress per-instance progress lines
        #[arg(long)]
        no_progress: bool,

        /// Agent timeout in seconds
        #[arg(long, default_value_t = 1800)]
        timeout: u64,

        /// Shell command that boots the sandbox before the agent
        #[arg(long)]
        env_setup: Option<String>,

        /// Shell command that tears the sandbox down afterwards
        #[arg(long)]
        env_teardown: Option<String>,

        /// The agent is human-driven (forces a single worker)
        #[arg(long)]
        interactive: bool,
    },

    /// Validate a manifest (parse only)
    Validate {
        /// Instance manifest
        manifest: PathBuf,
    },

    /// Re-merge an output directory's predictions
    Merge {
        /// Output directory of a previous run
        output_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            manifest,
            agent_cmd,
            output_dir,
            suffix,
            workers,
            redo_existing,
            strict,
            no_progress,
            timeout,
            env_setup,
            env_teardown,
            interactive,
        } => {
            run_batch(RunArgs {
                manifest,
                agent_cmd,
                output_dir,
                suffix,
                workers,
                redo_existing,
                strict,
                no_progress,
                timeout,
                env_setup,
                env_teardown,
                interactive,
            })
            .await
        }
        Commands::Validate { manifest } => validate_manifest(&manifest),
        Commands::Merge { output_dir } => remerge(&output_dir),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

struct RunArgs {
    manifest: PathBuf,
    agent_cmd: String,
    output_dir: Option<PathBuf>,
    suffix: String,
    workers: usize,
    redo_existing: bool,
    strict: bool,
    no_progress: bool,
    timeout: u64,
    env_setup: Option<String>,
    env_teardown: Option<String>,
    interactive: bool,
}

async fn run_batch(args: RunArgs) -> Result<(), DroverError> {
    let output_dir = args
        .output_dir
        .unwrap_or_else(|| default_output_dir(&args.manifest, &args.suffix));
    std::fs::create_dir_all(&output_dir)?;

    init_logging(&output_dir)?;

    let instances = load_manifest(&args.manifest)?;
    println!(
        "{} Running {} instances with {} workers. Output: {}",
        "→".cyan(),
        instances.len().to_string().cyan().bold(),
        args.workers.to_string().cyan(),
        output_dir.display()
    );

    let executor = CommandExecutor::new(args.agent_cmd)
        .with_timeout(Duration::from_secs(args.timeout))
        .with_env_setup(args.env_setup)
        .with_env_teardown(args.env_teardown)
        .interactive(args.interactive);

    let config = RunBatchConfig {
        output_dir,
        workers: args.workers,
        redo_existing: args.redo_existing,
        strict: args.strict,
        progress: !args.no_progress,
        ..Default::default()
    };

    let batch = RunBatch::new(instances, Arc::new(executor), config)?;

    // Ctrl-c stops admitting new instances; in-flight ones drain.
    let cancel = batch.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received: no new instances will start; waiting for running ones");
            cancel.cancel();
        }
    });

    let summary = batch.run().await?;
    println!(
        "{} Done: {}/{} instances completed. Predictions: {}",
        "✓".green(),
        summary.n_completed,
        summary.n_total,
        summary.preds_path.display()
    );
    Ok(())
}

fn validate_manifest(manifest: &PathBuf) -> Result<(), DroverError> {
    tracing_subscriber::fmt()
        .with_env_filter(default_env_filter())
        .init();

    let instances = load_manifest(manifest)?;
    println!("{} Manifest '{}' is valid", "✓".green(), manifest.display());
    println!("  Instances: {}", instances.len());
    println!("  First id:  {}", instances[0].id);
    Ok(())
}

fn remerge(output_dir: &PathBuf) -> Result<(), DroverError> {
    tracing_subscriber::fmt()
        .with_env_filter(default_env_filter())
        .init();

    // Every subdirectory is an instance dir; merge sorts by id anyway.
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(output_dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    let out = merge_predictions(&dirs, &output_dir.join(PREDS_FILE))?;
    println!("{} Merged {} into {}", "✓".green(), dirs.len(), out.display());
    Ok(())
}

/// Stderr + run-level log file (`run_batch.log`) in the output dir.
fn init_logging(output_dir: &std::path::Path) -> Result<(), DroverError> {
    let log_file = std::fs::File::create(output_dir.join(RUN_LOG))?;
    tracing_subscriber::registry()
        .with(default_env_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .init();
    Ok(())
}

fn default_env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into())
}
