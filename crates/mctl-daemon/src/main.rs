//! Device daemon entry point.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mctl_core::config::ConfigLoader;
use mctl_daemon::orchestrator::{Orchestrator, OrchestratorConfig};

#[derive(Parser, Debug)]
#[command(name = "mctl-daemon", about = "Master Control device daemon")]
struct Args {
    /// Directory holding workload YAML files (and optional daemon.yaml).
    #[arg(long, default_value = "./configs")]
    config_dir: PathBuf,

    /// Path of the embedded state database.
    #[arg(long, default_value = "./state.db")]
    db_path: PathBuf,

    /// Directory for per-workload log files.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Local control socket path.
    #[arg(long, default_value = "/tmp/mctl.sock")]
    socket_path: PathBuf,

    /// Worker binary; defaults to the mctl-worker next to this executable.
    #[arg(long)]
    worker_exe: Option<PathBuf>,

    /// Log filter (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

fn default_worker_exe() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("mctl-worker")))
        .unwrap_or_else(|| PathBuf::from("mctl-worker"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(args.log.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let daemon = ConfigLoader::new(&args.config_dir).load_daemon_config()?;
    let orchestrator = Orchestrator::new(OrchestratorConfig {
        config_dir: args.config_dir,
        db_path: args.db_path,
        log_dir: args.log_dir,
        socket_path: args.socket_path,
        worker_exe: args.worker_exe.unwrap_or_else(default_worker_exe),
        daemon,
    })?;
    orchestrator.start().await?;

    let requested = orchestrator.shutdown_requested();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
        }
        _ = requested.cancelled() => {
            tracing::info!("shutdown requested via control surface");
        }
    }
    orchestrator.shutdown().await;
    Ok(())
}
