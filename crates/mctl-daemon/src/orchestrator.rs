//! Central coordinator for the device daemon.
//!
//! Owns construction, the startup/shutdown order, the hot-reload differ,
//! and the command surface shared by the local socket and HTTP control
//! servers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mctl_core::config::{ConfigError, ConfigLoader, DaemonConfig};
use mctl_core::models::{
    CommandResponse, HeartbeatPayload, ReloadReport, RunMode, RunRecord, WorkloadInfo,
    WorkloadSpec, WorkloadState, WorkloadType,
};

use crate::control::{http as control_http, local as control_local};
use crate::health::HealthMonitor;
use crate::heartbeat::HeartbeatReporter;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::state_store::{StateStore, StateWrite, StoreError};
use crate::supervisor::{Supervisor, SupervisorContext, DEFAULT_GRACE};

/// Name of the marker file carrying the deployed bundle version.
const VERSION_MARKER: &str = ".mctl-version";

/// Everything the orchestrator needs to boot.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub config_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub socket_path: PathBuf,
    pub worker_exe: PathBuf,
    pub daemon: DaemonConfig,
}

/// Central coordinator. Owns the registry, supervisors, scheduler, health
/// monitor, state store, and control surfaces.
pub struct Orchestrator {
    cfg: OrchestratorConfig,
    registry: Arc<Registry>,
    scheduler: Arc<Scheduler>,
    health: Arc<HealthMonitor>,
    store: Arc<StateStore>,
    supervisor_ctx: Arc<SupervisorContext>,
    shutdown: CancellationToken,
    store_shutdown: CancellationToken,
    shutdown_requested: CancellationToken,
    reload_lock: tokio::sync::Mutex<()>,
    deployed_version: RwLock<Option<String>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Opens the state store and wires the components. Failing to open the
    /// store is fatal.
    pub fn new(cfg: OrchestratorConfig) -> Result<Arc<Self>, StoreError> {
        let store = Arc::new(StateStore::open(&cfg.db_path)?);
        let registry = Arc::new(Registry::new());
        let shutdown = CancellationToken::new();
        let supervisor_ctx = Arc::new(SupervisorContext {
            store: store.handle(),
            worker_exe: cfg.worker_exe.clone(),
            log_dir: cfg.log_dir.clone(),
            shutdown: shutdown.clone(),
        });
        Ok(Arc::new(Self {
            registry: Arc::clone(&registry),
            scheduler: Arc::new(Scheduler::new()),
            health: Arc::new(HealthMonitor::new(registry)),
            store,
            supervisor_ctx,
            shutdown,
            store_shutdown: CancellationToken::new(),
            shutdown_requested: CancellationToken::new(),
            reload_lock: tokio::sync::Mutex::new(()),
            deployed_version: RwLock::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
            cfg,
        }))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn deployed_version(&self) -> Option<String> {
        self.deployed_version.read().expect("version lock").clone()
    }

    /// Cancelled when a control surface asked the daemon to exit.
    pub fn shutdown_requested(&self) -> CancellationToken {
        self.shutdown_requested.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.cancel();
    }

    /// Boot: load persisted state, load configs, register and start
    /// workloads per policy, then bring up the background services.
    pub async fn start(self: &Arc<Self>) -> Result<(), ConfigError> {
        info!(config_dir = %self.cfg.config_dir.display(), "orchestrator starting");

        {
            let store = Arc::clone(&self.store);
            let token = self.store_shutdown.clone();
            self.spawn_task(async move { store.run_writer(token).await });
        }

        let persisted = match self.store.load_states() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "failed to load persisted workload state");
                Vec::new()
            }
        };

        self.refresh_version_marker();

        let loader = ConfigLoader::new(&self.cfg.config_dir);
        let specs = loader.load_all()?;
        info!(count = specs.len(), "loaded workloads");

        for mut spec in specs {
            let persisted_row = persisted.iter().find(|p| p.name == spec.name);
            // The configured version wins; the persisted one only fills a
            // gap so reporting stays continuous across daemon restarts.
            if spec.version.is_none() {
                spec.version = persisted_row.and_then(|p| p.version.clone());
            }
            let supervisor = Supervisor::new(spec, Arc::clone(&self.supervisor_ctx));
            if let Some(row) = persisted_row {
                supervisor.seed(
                    row.run_count,
                    row.consecutive_failures,
                    row.last_error.clone(),
                );
            }
            if let Err(e) = self.registry.insert(supervisor) {
                warn!(error = %e, "skipping duplicate workload");
            }
        }

        for supervisor in self.registry.snapshot() {
            self.apply_boot_policy(&supervisor).await;
        }

        {
            let scheduler = Arc::clone(&self.scheduler);
            let registry = Arc::clone(&self.registry);
            let token = self.shutdown.clone();
            self.spawn_task(async move { scheduler.run(registry, token).await });
        }
        {
            let health = Arc::clone(&self.health);
            let token = self.shutdown.clone();
            self.spawn_task(async move { health.run(token).await });
        }
        {
            let orch = Arc::clone(self);
            let socket = self.cfg.socket_path.clone();
            let token = self.shutdown.clone();
            self.spawn_task(async move {
                if let Err(e) = control_local::serve(socket, orch, token).await {
                    warn!(error = %e, "local control server failed");
                }
            });
        }

        let fleet = self.cfg.daemon.fleet.clone();
        if fleet.enabled {
            let addr = format!("{}:{}", fleet.api_host, fleet.api_port);
            let orch = Arc::clone(self);
            let token = self.shutdown.clone();
            let api_token = fleet.api_token.clone();
            self.spawn_task(async move {
                if let Err(e) = control_http::serve(addr, orch, api_token, token).await {
                    warn!(error = %e, "device http api failed");
                }
            });

            if fleet.central_api_url.is_some() {
                let reporter = HeartbeatReporter::new(Arc::clone(self), fleet);
                let token = self.shutdown.clone();
                self.spawn_task(async move { reporter.run(token).await });
            }
        }

        info!("orchestrator ready");
        Ok(())
    }

    /// Start-on-boot policy: `forever` and `schedule` workloads start (or
    /// schedule) automatically; `n_times` and `script` wait for an
    /// explicit request.
    async fn apply_boot_policy(&self, supervisor: &Arc<Supervisor>) {
        let spec = supervisor.spec();
        match spec.run_mode {
            RunMode::Schedule => {
                if let Some(expr) = spec.schedule.as_deref() {
                    if let Err(e) = self.scheduler.add(&spec.name, expr) {
                        warn!(workload = %spec.name, error = %e, "failed to schedule workload");
                    }
                }
            }
            RunMode::Forever if spec.workload_type != WorkloadType::Script => {
                if let Err(e) = supervisor.start().await {
                    warn!(workload = %spec.name, error = %e, "failed to start workload");
                }
            }
            _ => {}
        }
    }

    /// Graceful shutdown: stop scheduler and health monitor, stop all
    /// supervisors in parallel, then flush and close the store.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.shutdown.cancel();

        let supervisors = self.registry.snapshot();
        futures::future::join_all(
            supervisors
                .iter()
                .map(|supervisor| supervisor.stop(DEFAULT_GRACE)),
        )
        .await;

        self.store_shutdown.cancel();
        let tasks = {
            let mut tasks = self.tasks.lock().expect("tasks lock");
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            let _ = task.await;
        }
        if self.cfg.socket_path.exists() {
            let _ = std::fs::remove_file(&self.cfg.socket_path);
        }
        info!("orchestrator stopped");
    }

    /// Re-reads the configuration directory and applies the minimal set of
    /// mutations against the live registry.
    pub async fn reload(&self) -> Result<ReloadReport, ConfigError> {
        let _guard = self.reload_lock.lock().await;
        let loader = ConfigLoader::new(&self.cfg.config_dir);
        let new_specs = loader.load_all()?;

        let mut new_by_name: std::collections::BTreeMap<String, WorkloadSpec> = new_specs
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();
        let old_supervisors = self.registry.snapshot();

        let mut report = ReloadReport::default();

        // Removed: stop, unschedule, drop state.
        for supervisor in &old_supervisors {
            let name = supervisor.name().to_string();
            if new_by_name.contains_key(&name) {
                continue;
            }
            self.scheduler.remove(&name);
            supervisor.stop(DEFAULT_GRACE).await;
            self.registry.remove(&name);
            self.store.handle().enqueue(StateWrite::DeleteState {
                name: name.clone(),
            });
            info!(workload = %name, "workload removed");
            report.removed.push(name);
        }

        // Changed or unchanged.
        for supervisor in &old_supervisors {
            let name = supervisor.name().to_string();
            let Some(new_spec) = new_by_name.remove(&name) else {
                continue;
            };
            if *supervisor.spec() == new_spec {
                report.unchanged.push(name);
                continue;
            }
            let was_active = supervisor.is_active();
            self.scheduler.remove(&name);
            self.registry.swap(&name, new_spec.clone());
            if new_spec.run_mode == RunMode::Schedule {
                if let Some(expr) = new_spec.schedule.as_deref() {
                    if let Err(e) = self.scheduler.add(&name, expr) {
                        warn!(workload = %name, error = %e, "failed to reschedule workload");
                    }
                }
                if was_active {
                    // Restarting under schedule mode means the next firing
                    // comes from the scheduler.
                    supervisor.stop(DEFAULT_GRACE).await;
                }
            } else if was_active {
                if let Err(e) = supervisor.restart().await {
                    warn!(workload = %name, error = %e, "failed to restart workload");
                }
            }
            info!(workload = %name, "workload restarted (config changed)");
            report.restarted.push(name);
        }

        // Added: register and apply the boot policy.
        for (name, spec) in new_by_name {
            let supervisor = Supervisor::new(spec, Arc::clone(&self.supervisor_ctx));
            if let Err(e) = self.registry.insert(Arc::clone(&supervisor)) {
                warn!(error = %e, "skipping duplicate workload");
                continue;
            }
            self.apply_boot_policy(&supervisor).await;
            info!(workload = %name, "workload added");
            report.added.push(name);
        }

        self.refresh_version_marker();

        report.added.sort();
        report.removed.sort();
        report.restarted.sort();
        report.unchanged.sort();
        info!(
            added = report.added.len(),
            removed = report.removed.len(),
            restarted = report.restarted.len(),
            unchanged = report.unchanged.len(),
            "configs reloaded"
        );
        Ok(report)
    }

    // --- command surface ---

    pub async fn start_workload(&self, name: &str) -> CommandResponse {
        match self.registry.get(name) {
            None => unknown_workload(name),
            Some(supervisor) => match supervisor.start().await {
                Ok(()) => CommandResponse {
                    success: true,
                    message: format!("Started '{name}'"),
                },
                Err(_) => CommandResponse {
                    success: false,
                    message: format!("Workload '{name}' is already running"),
                },
            },
        }
    }

    pub async fn stop_workload(&self, name: &str) -> CommandResponse {
        match self.registry.get(name) {
            None => unknown_workload(name),
            Some(supervisor) => {
                if !supervisor.is_active() {
                    return CommandResponse {
                        success: false,
                        message: format!("Workload '{name}' is not running"),
                    };
                }
                supervisor.stop(DEFAULT_GRACE).await;
                CommandResponse {
                    success: true,
                    message: format!("Stopped '{name}'"),
                }
            }
        }
    }

    pub async fn restart_workload(&self, name: &str) -> CommandResponse {
        match self.registry.get(name) {
            None => unknown_workload(name),
            Some(supervisor) => match supervisor.restart().await {
                Ok(()) => CommandResponse {
                    success: true,
                    message: format!("Started '{name}'"),
                },
                Err(_) => CommandResponse {
                    success: false,
                    message: format!("Workload '{name}' is already running"),
                },
            },
        }
    }

    pub fn list_infos(&self) -> Vec<WorkloadInfo> {
        self.registry
            .snapshot()
            .iter()
            .map(|supervisor| supervisor.info())
            .collect()
    }

    pub fn workload(&self, name: &str) -> Option<(Arc<WorkloadSpec>, WorkloadState)> {
        let supervisor = self.registry.get(name)?;
        Some((supervisor.spec(), supervisor.state_snapshot()))
    }

    /// Last `lines` lines from the workload's log file. `None` when the
    /// workload is unknown.
    pub fn read_logs(&self, name: &str, lines: usize) -> Option<Vec<String>> {
        if !self.registry.contains(name) {
            return None;
        }
        let Some(log_dir) = self.cfg.log_dir.as_ref() else {
            return Some(Vec::new());
        };
        let path = log_dir.join(format!("{name}.log"));
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Some(Vec::new());
        };
        let all: Vec<&str> = contents.lines().collect();
        let start = all.len().saturating_sub(lines);
        Some(all[start..].iter().map(|line| line.to_string()).collect())
    }

    pub fn run_history(&self, name: &str, limit: usize) -> Vec<RunRecord> {
        self.store.run_history(name, limit).unwrap_or_else(|e| {
            warn!(workload = name, error = %e, "run history query failed");
            Vec::new()
        })
    }

    pub fn heartbeat_payload(&self) -> HeartbeatPayload {
        let client_name = self
            .cfg
            .daemon
            .fleet
            .client_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        HeartbeatPayload {
            client_name,
            timestamp: chrono::Utc::now(),
            deployed_version: self.deployed_version(),
            workloads: self.list_infos(),
            system: self.health.metrics_snapshot(),
        }
    }

    fn refresh_version_marker(&self) {
        let marker = self
            .cfg
            .config_dir
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(VERSION_MARKER);
        let version = std::fs::read_to_string(marker)
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|v| !v.is_empty());
        *self.deployed_version.write().expect("version lock") = version;
    }

    fn spawn_task<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.lock().expect("tasks lock").push(handle);
    }
}

fn unknown_workload(name: &str) -> CommandResponse {
    CommandResponse {
        success: false,
        message: format!("Unknown workload: {name}"),
    }
}
