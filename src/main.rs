//! dagrun CLI.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use dagrun::batch::adapter::ShellAdapter;
use dagrun::config::{self};
#[cfg(not(unix))]
use dagrun::executor::forkless::ForklessBackend;
#[cfg(unix)]
use dagrun::executor::process::ProcessBackend;
use dagrun::journal::Journal;
use dagrun::model::TestSpec;
use dagrun::orchestrator::Orchestrator;
use dagrun::store::TestCaseStore;

#[derive(Parser)]
#[command(name = "dagrun")]
#[command(about = "Dependency-DAG test execution orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "dagrun.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve dependencies and run the test suite.
    Run {
        /// Path to a JSON file holding the pre-parsed, pre-filtered test
        /// specs (the output of the external parser/discovery collaborator).
        #[arg(long)]
        tests: PathBuf,

        /// Override run.max_parallel.
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Hidden batch re-entry flag: this invocation is running inside a
        /// submitted batch job and should execute only the tests assigned
        /// to batch id `N`.
        #[arg(long, hide = true)]
        qsub_id: Option<u32>,
    },

    /// Validate a configuration file without running anything.
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            tests,
            parallel,
            qsub_id,
        } => run(&cli.config, &tests, parallel, qsub_id).await,
        Commands::ValidateConfig => validate_config(&cli.config),
    }
}

async fn run(
    config_path: &Path,
    tests_path: &Path,
    parallel_override: Option<usize>,
    qsub_id: Option<u32>,
) -> Result<()> {
    let mut cfg = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    if let Some(parallel) = parallel_override {
        cfg.run.max_parallel = parallel;
    }

    info!(path = %config_path.display(), "loaded configuration");

    let specs_raw = std::fs::read_to_string(tests_path)
        .with_context(|| format!("failed to read test specs from {}", tests_path.display()))?;
    let specs: Vec<TestSpec> = serde_json::from_str(&specs_raw)
        .with_context(|| format!("failed to parse test specs from {}", tests_path.display()))?;

    let results_root = cfg.directories.results_root.clone();
    std::fs::create_dir_all(&results_root)
        .with_context(|| format!("failed to create results root {}", results_root.display()))?;

    let mut store = TestCaseStore::new();
    for spec in specs {
        store.insert(spec, &results_root);
    }
    info!(count = store.len(), "loaded test specs");

    let journal = Journal::open(&results_root.join("journal.jsonl"))
        .with_context(|| "failed to open results journal")?;

    let mut orchestrator = Orchestrator::new(cfg.clone(), store, journal, "local");

    // A `--qsub-id` invocation is a batch job re-entering this binary to run
    // the subset of tests its job script was handed; those tests'
    // dependencies were already satisfied by the parent before it grouped
    // them, so there is nothing left to resolve, and running through
    // `run_batch` again would just resubmit the same subset forever.
    let is_batch_child = qsub_id.is_some();
    if !is_batch_child && !cfg.run.baseline {
        orchestrator
            .resolve_dependencies()
            .context("failed to resolve test dependencies")?;
    }

    install_shutdown_handler(orchestrator.shutdown_handle());

    let summary = if cfg.run.baseline {
        info!("running in baseline mode");
        #[cfg(unix)]
        {
            orchestrator.run_baseline::<ProcessBackend>().await?
        }
        #[cfg(not(unix))]
        {
            orchestrator.run_baseline::<ForklessBackend>().await?
        }
    } else if is_batch_child {
        info!(qsub_id = qsub_id.unwrap(), "running as batch job re-entry");
        #[cfg(unix)]
        {
            orchestrator.run_direct::<ProcessBackend>().await?
        }
        #[cfg(not(unix))]
        {
            orchestrator.run_direct::<ForklessBackend>().await?
        }
    } else if cfg.batch.enabled {
        let scripts_dir = results_root.join("batch-scripts");
        std::fs::create_dir_all(&scripts_dir)?;
        let self_exe = std::env::current_exe()?.display().to_string();
        orchestrator
            .run_batch(ShellAdapter, &scripts_dir, &self_exe)
            .await?
    } else {
        #[cfg(unix)]
        {
            orchestrator.run_direct::<ProcessBackend>().await?
        }
        #[cfg(not(unix))]
        {
            orchestrator.run_direct::<ForklessBackend>().await?
        }
    };

    info!(exit_code = summary.exit_code(), "run complete");
    std::process::exit(summary.exit_code());
}

/// Spawn a background task translating `SIGINT`/`SIGTERM`/`SIGHUP` (`Ctrl-C`
/// only, on non-unix targets) into the orchestrator's shutdown flag, so a
/// run stops accepting new ready tests and escalate-kills active children
/// or cancels submitted batch jobs instead of leaving them unattended.
fn install_shutdown_handler(shutdown: std::sync::Arc<std::sync::atomic::AtomicBool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        tokio::spawn(async move {
            let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
            let mut sighup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
                _ = sighup.recv() => {}
            }
            tracing::warn!("shutdown signal received, cancelling outstanding work");
            shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::warn!("shutdown signal received, cancelling outstanding work");
            shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        });
    }
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(cfg) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!(
                "  Platform: {} cores, {} devices (oversubscription: {})",
                cfg.platform.max_cores, cfg.platform.max_devices, cfg.platform.allow_oversubscription
            );
            println!("  Run: max_parallel={}, baseline={}", cfg.run.max_parallel, cfg.run.baseline);
            println!(
                "  Batch: enabled={}, adapter={}, group_size={}",
                cfg.batch.enabled, cfg.batch.adapter, cfg.batch.group_size
            );
            println!("  Results root: {}", cfg.directories.results_root.display());
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    }
}
