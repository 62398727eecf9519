//! Central controller entry point.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mctl_central::api::{self, CentralApiState};
use mctl_central::deployer::Deployer;
use mctl_central::fleet_client::FleetClient;
use mctl_central::fleet_store::{run_stale_sweeper, FleetStore};
use mctl_central::inventory;
use mctl_core::config::ConfigLoader;

#[derive(Parser, Debug)]
#[command(name = "mctl-central", about = "Master Control central controller")]
struct Args {
    /// Directory holding daemon.yaml (the `central` section applies).
    #[arg(long, default_value = "./configs")]
    config_dir: PathBuf,

    /// Log filter (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(args.log.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ConfigLoader::new(&args.config_dir).load_daemon_config()?;
    let central = config.central;
    if !central.enabled {
        tracing::warn!("central.enabled is false in daemon.yaml; serving anyway");
    }

    let store = Arc::new(FleetStore::open(Path::new(&central.db_path))?);
    inventory::seed_from_file(&store, Path::new(&central.inventory_path))?;

    let fleet = Arc::new(FleetClient::new(central.api_token.clone()));
    let deploy_script = central
        .deploy_script_path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./deploy-clients.sh"));
    let deployer = Arc::new(Deployer::new(
        Arc::clone(&store),
        Arc::clone(&fleet),
        deploy_script,
    ));

    let shutdown = CancellationToken::new();
    {
        let store = Arc::clone(&store);
        let threshold = Duration::from_secs_f64(central.stale_threshold_s.max(1.0));
        let token = shutdown.clone();
        tokio::spawn(async move { run_stale_sweeper(store, threshold, token).await });
    }

    let state = CentralApiState {
        store,
        fleet,
        deployer,
        api_token: central.api_token.clone().map(Arc::new),
    };
    let addr = format!("{}:{}", central.host, central.port);

    tokio::select! {
        result = api::serve(addr, state, shutdown.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
            shutdown.cancel();
        }
    }
    Ok(())
}
