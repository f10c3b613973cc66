//! # zeroshot-cli
//!
//! Binary entry point for the zeroshot orchestrator.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Settings-file resolution (`ZEROSHOT_SETTINGS_FILE`)
//! - Process-group leadership so no child is orphaned on termination
//! - A headless status observer fed by the process metrics probe

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use zeroshot_core::{
    AgentState, ClusterConfig, ClusterState, Orchestrator, ProcessProbe, StartOptions,
    SETTINGS_FILE_ENV,
};

// Unix-specific process management for process group leadership
#[cfg(unix)]
mod process_management {
    use nix::unistd::{setpgid, Pid};
    use tracing::debug;

    /// Makes the orchestrator a process group leader.
    ///
    /// Spawned provider CLIs get their own groups, but keeping leadership
    /// here means a signal to the orchestrator never strands the tree.
    pub fn setup_process_group() {
        let pid = Pid::this();
        if let Err(e) = setpgid(pid, pid) {
            // EPERM means we already lead a group (started from a shell).
            if e != nix::errno::Errno::EPERM {
                debug!("Could not set process group ({e}), continuing anyway");
            }
        }
        debug!("Process group initialized: PID {pid}");
    }
}

#[cfg(not(unix))]
mod process_management {
    pub fn setup_process_group() {}
}

/// zeroshot - multi-agent cluster orchestrator
#[derive(Parser, Debug)]
#[command(name = "zeroshot", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a cluster and run it to completion
    Run(RunArgs),
}

/// Arguments for the run subcommand.
#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the cluster configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Inline seed text (mutually exclusive with -P)
    #[arg(short = 'p', long = "prompt-text", conflicts_with = "prompt_file")]
    prompt_text: Option<String>,

    /// Seed file path (mutually exclusive with -p)
    #[arg(short = 'P', long = "prompt-file", conflicts_with = "prompt_text")]
    prompt_file: Option<PathBuf>,

    /// Isolate the cluster in a git worktree of --cwd
    #[arg(long)]
    worktree: bool,

    /// Isolate the cluster in a container of this image
    #[arg(long, value_name = "IMAGE", conflicts_with = "worktree")]
    docker: Option<String>,

    /// Source directory (defaults to the current directory)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Grace window in seconds for cooperative stop
    #[arg(long, default_value_t = 5)]
    grace_secs: u64,

    /// Directory for per-cluster ledger mirror files
    #[arg(long)]
    mirror_dir: Option<PathBuf>,

    /// Seconds between status lines (0 disables the observer)
    #[arg(long, default_value_t = 5)]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    process_management::setup_process_group();

    match cli.command {
        Commands::Run(args) => run_command(args).await,
    }
}

/// Resolves the configuration: explicit flag, then the settings env var,
/// then `zeroshot.yml` in the working directory.
fn load_config(explicit: Option<&PathBuf>) -> Result<ClusterConfig> {
    if let Some(path) = explicit {
        return ClusterConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()));
    }
    if let Some(config) =
        ClusterConfig::from_settings_env().context("loading settings file")?
    {
        return Ok(config);
    }
    ClusterConfig::from_file("zeroshot.yml").with_context(|| {
        format!("loading zeroshot.yml (set --config or {SETTINGS_FILE_ENV})")
    })
}

async fn run_command(args: RunArgs) -> Result<()> {
    let config = load_config(args.config.as_ref())?;

    let seed_text = match (&args.prompt_text, &args.prompt_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        (None, None) => anyhow::bail!("provide a seed with -p or -P"),
    };

    let orchestrator =
        Arc::new(Orchestrator::new().with_grace(Duration::from_secs(args.grace_secs)));

    let cluster_id = orchestrator
        .start(
            config,
            serde_json::json!({ "text": seed_text }),
            StartOptions {
                worktree: args.worktree,
                docker: args.docker.clone(),
                cwd: args.cwd.clone(),
                mirror_dir: args.mirror_dir.clone(),
                ..StartOptions::default()
            },
        )
        .await
        .context("cluster start failed")?;
    info!(cluster = %cluster_id, "Cluster started");

    if args.status_interval > 0 {
        spawn_status_observer(
            Arc::clone(&orchestrator),
            cluster_id.clone(),
            Duration::from_secs(args.status_interval),
        );
    }

    // Run until the cluster stops itself or the user interrupts.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, killing all clusters");
                orchestrator.kill_all().await;
                std::process::exit(130);
            }
            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                let state = orchestrator
                    .get_cluster(&cluster_id)
                    .map(|c| c.state());
                if matches!(state, Some(ClusterState::Stopped) | None) {
                    break;
                }
            }
        }
    }

    info!(cluster = %cluster_id, "Cluster finished");
    Ok(())
}

/// Headless status sink: periodically logs cluster and agent state, with
/// process metrics for any executing provider subprocess.
fn spawn_status_observer(
    orchestrator: Arc<Orchestrator>,
    cluster_id: String,
    interval: Duration,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(cluster) = orchestrator.get_cluster(&cluster_id) else {
                break;
            };
            if cluster.state() == ClusterState::Stopped {
                break;
            }

            for (agent_id, runtime) in cluster.agents() {
                let status = runtime.status();
                match (status.state(), status.current_pid()) {
                    (AgentState::Executing, Some(pid)) => {
                        match ProcessProbe::sample(pid, Duration::from_millis(250)).await {
                            Some(m) => info!(
                                agent = %agent_id,
                                pid = pid,
                                cpu = format!("{:.1}%", m.cpu_percent),
                                rss_mb = m.rss_bytes / (1024 * 1024),
                                "executing"
                            ),
                            None => info!(agent = %agent_id, pid = pid, "executing"),
                        }
                    }
                    (state, _) => info!(
                        agent = %agent_id,
                        state = ?state,
                        cursor = status.cursor(),
                        iterations = status.iterations(),
                        "status"
                    ),
                }
            }
        }
    });
}
