//! clusterup CLI
//!
//! Runs installer phases against every host of a cluster configuration over SSH

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use eyre::{WrapErr, bail};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use clusterup_api::{HostStatus, NodeResult, RunEvent, RunSummary};
use clusterup_core::artifacts::DEFAULT_SERVE_DIR;
use clusterup_core::{
    ArtifactLayout, ClusterActions, InstallOptions, MultiRunner, PreflightOptions, Role,
    RunHandle, RunOutcome, RunRequest, SshExecutorFactory,
};

mod config;

/// Delay between progress reports with `--progress`
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "clusterup")]
#[command(about = "Parallel SSH installer for cluster nodes", version, long_about = None)]
struct Cli {
    /// Config file (default: $CLUSTERUP_CONFIG, genconf/config.toml, user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for per-phase state files
    #[arg(long, global = true, default_value = "genconf/state")]
    state_dir: PathBuf,

    /// Directory holding the install script, packages and bootstrap tarball
    #[arg(long, global = true, default_value = DEFAULT_SERVE_DIR)]
    serve_dir: PathBuf,

    /// Run in the background and report progress from the state file
    #[arg(long, global = true)]
    progress: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check every host is ready for installation
    Preflight {
        /// Hosts cannot reach package repositories; skip prerequisites
        #[arg(long)]
        offline: bool,
        /// Prerequisites are already installed
        #[arg(long)]
        skip_prereqs: bool,
        /// Preflight script (default: the install script in the serve dir)
        #[arg(long)]
        script: Option<PathBuf>,
    },
    /// Install on every host
    Deploy {
        /// Only rerun these hosts, resuming the previous deploy state
        #[arg(long, num_args = 1.., value_name = "HOST")]
        retry: Vec<String>,
        /// Remove an existing installation first
        #[arg(long)]
        remove_stale: bool,
    },
    /// Wait for node and cluster health checks to pass
    Postflight,
    /// Remove the installation from every host
    Uninstall,
    /// Install host prerequisites
    #[command(name = "install-prereqs")]
    InstallPrereqs,
    /// Print the resolved host list
    Nodes,
}

fn init_tracing(verbose: u8, json: bool) {
    let default = match verbose {
        0 => "clusterup=info,clusterup_core=info,clusterup_exec=warn",
        1 => "clusterup=debug,clusterup_core=debug,clusterup_exec=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn log_event(event: &RunEvent) {
    match event {
        RunEvent::PhaseStarted { phase, hosts } => info!(%phase, hosts, "phase started"),
        RunEvent::StageStarted {
            host, chain, stage, ..
        } => debug!(%host, %chain, %stage, "stage started"),
        RunEvent::StageFinished {
            host,
            stage,
            exit_code,
            ..
        } => debug!(%host, %stage, exit_code, "stage finished"),
        RunEvent::HostFinished {
            phase,
            host,
            status,
        } => match status {
            HostStatus::Failed => warn!(%phase, %host, %status, "host finished"),
            _ => info!(%phase, %host, %status, "host finished"),
        },
        RunEvent::PhaseFinished {
            phase,
            succeeded,
            failed,
        } => info!(%phase, succeeded, failed, "phase finished"),
    }
}

fn spawn_event_logger(mut events: broadcast::Receiver<RunEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "progress events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Wait on a detached run, logging its state file as it fills
async fn follow(handle: RunHandle) -> Result<Vec<NodeResult>> {
    while !handle.is_finished() {
        tokio::time::sleep(PROGRESS_INTERVAL).await;
        if let Some(state) = handle.progress() {
            info!(
                phase = %handle.phase(),
                running = state.count(HostStatus::Running),
                succeeded = state.count(HostStatus::Success),
                failed = state.count(HostStatus::Failed),
                total = state.total_hosts.unwrap_or_default(),
                "progress"
            );
        }
    }
    Ok(handle.wait().await?)
}

async fn collect(outcome: RunOutcome) -> Result<Vec<NodeResult>> {
    match outcome {
        RunOutcome::Completed(results) => Ok(results),
        RunOutcome::Detached(handles) => {
            let mut results = Vec::new();
            for handle in handles {
                results.extend(follow(handle).await?);
            }
            Ok(results)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let resolved = config::load_default(cli.config.as_deref())?.resolve()?;

    if let Commands::Nodes = cli.command {
        for node in clusterup_core::resolve_nodes(&resolved)? {
            println!("{}\t{}", node.key(), node.role().map_or("-", Role::as_str));
        }
        return Ok(());
    }

    let factory = SshExecutorFactory::new(&resolved.ssh)?;
    let driver = MultiRunner::from_settings(&resolved.ssh, Arc::new(factory));
    spawn_event_logger(driver.subscribe());

    let layout = ArtifactLayout::from_env(&cli.serve_dir);
    let actions = ClusterActions::new(resolved, layout, Arc::new(driver));

    std::fs::create_dir_all(&cli.state_dir)
        .wrap_err_with(|| format!("failed to create {}", cli.state_dir.display()))?;
    let request = RunRequest {
        block: !cli.progress,
        state_dir: Some(cli.state_dir.clone()),
        resume: false,
    };

    let outcome = match cli.command {
        Commands::Preflight {
            offline,
            skip_prereqs,
            script,
        } => {
            let options = PreflightOptions {
                offline,
                skip_prereqs,
            };
            actions
                .preflight(script.as_deref(), options, &request)
                .await?
        }
        Commands::Deploy {
            retry,
            remove_stale,
        } => {
            let options = InstallOptions {
                retry: !retry.is_empty(),
                hosts: retry,
                remove_stale,
            };
            actions.install(&options, &request).await?
        }
        Commands::Postflight => actions.postflight(&request).await?,
        Commands::Uninstall => actions.uninstall(&request).await?,
        Commands::InstallPrereqs => actions.install_prereqs(&request).await?,
        Commands::Nodes => return Ok(()),
    };

    let results = collect(outcome).await?;
    println!("{}", serde_json::to_string_pretty(&results)?);

    let summary = RunSummary::from_results(&results);
    if !summary.all_succeeded() {
        for result in results.iter().filter(|r| !r.is_success()) {
            if let Some(stage) = result.failed_stage() {
                warn!(
                    host = %result.host,
                    stage = %stage.stage,
                    exit_code = stage.exit_code,
                    "failed"
                );
            }
        }
        bail!(
            "{} of {} hosts failed",
            summary.failed,
            summary.total_hosts
        );
    }

    info!(hosts = summary.total_hosts, "all hosts succeeded");
    Ok(())
}
