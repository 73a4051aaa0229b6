//! Testdeck command line
//!
//! Starts suites through the single-flight orchestrator and inspects runs,
//! targets and artifacts. Results are printed as JSON on stdout; logs go to
//! stderr.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use testdeck_common::{Database, Error, RunStatus};
use testdeck_daemon::{DaemonConfig, RunService, StartRunRequest};
use testdeck_viewer::{cleanup_generated_files, ArtifactCorrelator, CleanupOptions};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "testdeck")]
#[command(about = "Testdeck - single-flight Playwright runs and report triage")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "TESTDECK_CONFIG", default_value = "testdeck.toml")]
    config: PathBuf,

    /// Workspace root, overriding the configuration file
    #[arg(short, long, global = true)]
    workspace: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a suite and wait for it to finish
    Run {
        /// Suite path relative to the tests directory
        suite: Option<String>,

        /// Target id
        #[arg(short, long)]
        target: Option<String>,

        /// Show the browser
        #[arg(long)]
        headed: bool,

        /// Delay between browser actions in milliseconds
        #[arg(long, default_value_t = 0)]
        slow_mo: i64,

        /// Only rerun the tests that failed in this run
        #[arg(long)]
        rerun_failed_from: Option<String>,
    },

    /// List recent runs
    Runs,

    /// Show a run with its parsed report
    Show { run: String },

    /// Tail a run's stdout and stderr
    Logs {
        run: String,

        #[arg(short, long)]
        lines: Option<usize>,
    },

    /// List available suites
    Suites,

    /// List targets
    Targets,

    /// Register a target
    AddTarget { name: String, base_url: String },

    /// Rename or repoint a target
    UpdateTarget { id: String, name: String, base_url: String },

    /// Remove a target
    DeleteTarget { id: String },

    /// Mark runs left RUNNING by a crashed process as failed
    Reconcile,

    /// Inspect runs reconstructed from the artifacts directory
    #[command(subcommand)]
    Viewer(ViewerCommands),

    /// Manage agent-generated spec documents and tests
    #[command(subcommand)]
    Specs(SpecsCommands),
}

#[derive(Subcommand)]
enum SpecsCommands {
    /// List generated request/plan documents and agent tests; nothing is
    /// deleted without --delete
    Cleanup {
        /// Delete the listed files
        #[arg(long)]
        delete: bool,

        /// Leave generated tests in place
        #[arg(long)]
        keep_generated_tests: bool,
    },
}

#[derive(Subcommand)]
enum ViewerCommands {
    /// List artifact runs, newest first
    List,

    /// Show an artifact run with logs, screenshots and agent context
    Show {
        run: String,

        #[arg(short, long)]
        lines: Option<usize>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<DaemonConfig> {
    let mut config = DaemonConfig::load(&cli.config)?;
    if let Some(workspace) = &cli.workspace {
        config.workspace_root = workspace.clone();
    }
    config.apply_env_overrides();
    Ok(config)
}

fn open_service(config: &DaemonConfig) -> anyhow::Result<RunService> {
    let db = Database::open(config.db_path())?;
    Ok(RunService::new(config, Arc::new(db)))
}

async fn run_suite(service: &RunService, request: StartRunRequest) -> anyhow::Result<()> {
    let run = service.start(request).await?;
    info!("Run {} started ({})", run.id, run.suite_name);

    tokio::select! {
        _ = service.orchestrator().wait_until_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling run {}", run.id);
            if !service.cancel(&run.id) {
                warn!("Run {} was not cancellable in its current phase", run.id);
            }
            service.orchestrator().wait_until_idle().await;
        }
    }

    let details = service.get_run(&run.id).await?;
    print_json(&details)?;

    if details.run.run.status != RunStatus::Passed {
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run {
            suite,
            target,
            headed,
            slow_mo,
            rerun_failed_from,
        } => {
            let service = open_service(&config)?;
            let request = StartRunRequest {
                target_id: target,
                suite_name: suite,
                mode: Some(if headed { "headed" } else { "headless" }.to_string()),
                slow_mo_ms: Some(slow_mo),
                rerun_failed_only_from_run_id: rerun_failed_from,
            };
            run_suite(&service, request).await?;
        }
        Commands::Runs => print_json(&open_service(&config)?.list_runs()?)?,
        Commands::Show { run } => print_json(&open_service(&config)?.get_run(&run).await?)?,
        Commands::Logs { run, lines } => {
            print_json(&open_service(&config)?.tail_logs(&run, lines).await?)?
        }
        Commands::Suites => print_json(&open_service(&config)?.list_suites().await?)?,
        Commands::Targets => print_json(&open_service(&config)?.list_targets()?)?,
        Commands::AddTarget { name, base_url } => {
            print_json(&open_service(&config)?.create_target(&name, &base_url)?)?
        }
        Commands::UpdateTarget { id, name, base_url } => {
            print_json(&open_service(&config)?.update_target(&id, &name, &base_url)?)?
        }
        Commands::DeleteTarget { id } => {
            open_service(&config)?.delete_target(&id)?;
            print_json(&serde_json::json!({ "ok": true }))?;
        }
        Commands::Reconcile => {
            let reconciled = open_service(&config)?
                .orchestrator()
                .reconcile_stale_running_runs()?;
            print_json(&serde_json::json!({ "reconciled": reconciled }))?;
        }
        Commands::Viewer(command) => {
            let correlator = ArtifactCorrelator::new(config.resolver(), config.viewer.clone());
            match command {
                ViewerCommands::List => print_json(&correlator.list_runs().await)?,
                ViewerCommands::Show { run, lines } => {
                    let details = correlator
                        .get_run_details(&run, lines)
                        .await?
                        .ok_or_else(|| Error::not_found("artifact run", &run))?;
                    print_json(&details)?;
                }
            }
        }
        Commands::Specs(SpecsCommands::Cleanup {
            delete,
            keep_generated_tests,
        }) => {
            let options = CleanupOptions {
                dry_run: !delete,
                include_generated_tests: !keep_generated_tests,
            };
            let report =
                cleanup_generated_files(&config.resolver(), &config.viewer, &config.tests_dir(), options).await?;
            print_json(&report)?;
        }
    }

    Ok(())
}
