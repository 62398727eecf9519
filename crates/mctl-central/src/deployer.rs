//! Rolling deployer: batched deploy → reload → health gate → rollback.
//!
//! Targets are partitioned into batches of `batch_size` in list order.
//! Per-client work inside a batch runs concurrently; batches proceed
//! strictly in order. A batch that does not reach fully healthy triggers
//! the failure branch: automatic rollback of every touched client to its
//! `previous_version` when requested, a plain failure otherwise.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use mctl_core::models::{
    ClientStatus, DeploymentClientStatus, DeploymentRecord, DeploymentRequest, DeploymentStatus,
};

use crate::fleet_client::FleetClient;
use crate::fleet_store::{FleetStore, FleetStoreError};

/// Cadence of the post-reload health poll.
const HEALTH_POLL: Duration = Duration::from_secs(2);
/// How much of the sync procedure's output is kept for diagnostics.
const SYNC_OUTPUT_TAIL: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("no target clients available for deployment")]
    NoTargets,
    #[error("batch_size must be at least 1")]
    InvalidBatchSize,
    #[error("deployment not found: {0}")]
    NotFound(String),
    #[error("deployment '{id}' is {current} and cannot be cancelled", current = .status.as_str())]
    NotCancellable {
        id: String,
        status: DeploymentStatus,
    },
    #[error(transparent)]
    Store(#[from] FleetStoreError),
}

/// Drives rolling deployments across fleet clients.
pub struct Deployer {
    store: Arc<FleetStore>,
    fleet: Arc<FleetClient>,
    deploy_script: PathBuf,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl Deployer {
    pub fn new(store: Arc<FleetStore>, fleet: Arc<FleetClient>, deploy_script: PathBuf) -> Self {
        Self {
            store,
            fleet,
            deploy_script,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Creates and launches a deployment, returning its pending record.
    pub async fn start(self: &Arc<Self>, request: DeploymentRequest) -> Result<DeploymentRecord, DeployError> {
        if request.batch_size < 1 {
            return Err(DeployError::InvalidBatchSize);
        }
        let targets = match &request.target_clients {
            Some(targets) => targets.clone(),
            None => self
                .store
                .list_clients()?
                .into_iter()
                .filter(|client| client.status == ClientStatus::Online)
                .map(|client| client.name)
                .collect(),
        };
        if targets.is_empty() {
            return Err(DeployError::NoTargets);
        }

        let id = Uuid::new_v4().to_string();
        let batches = partition_batches(&targets, request.batch_size);
        let with_batch_numbers: Vec<(String, u32)> = batches
            .iter()
            .enumerate()
            .flat_map(|(number, batch)| {
                batch
                    .iter()
                    .map(move |client| (client.clone(), number as u32))
            })
            .collect();
        self.store
            .create_deployment(&id, &request.version, request.batch_size, &with_batch_numbers)?;

        let token = CancellationToken::new();
        self.active
            .lock()
            .expect("active lock")
            .insert(id.clone(), token.clone());
        {
            let deployer = Arc::clone(self);
            let id = id.clone();
            tokio::spawn(async move {
                deployer.execute(id, request, batches, token).await;
            });
        }

        self.store
            .get_deployment(&id)?
            .ok_or_else(|| DeployError::NotFound(id))
    }

    /// Cancels a pending or in-progress deployment. The current batch's
    /// in-flight work completes; no further batch starts.
    pub fn cancel(&self, id: &str) -> Result<(), DeployError> {
        let record = self
            .store
            .get_deployment(id)?
            .ok_or_else(|| DeployError::NotFound(id.to_string()))?;
        if !matches!(
            record.status,
            DeploymentStatus::Pending | DeploymentStatus::InProgress
        ) {
            return Err(DeployError::NotCancellable {
                id: id.to_string(),
                status: record.status,
            });
        }
        if let Some(token) = self.active.lock().expect("active lock").get(id) {
            token.cancel();
        }
        info!(deployment = id, "deployment cancellation requested");
        Ok(())
    }

    async fn execute(
        self: Arc<Self>,
        id: String,
        request: DeploymentRequest,
        batches: Vec<Vec<String>>,
        token: CancellationToken,
    ) {
        if let Err(e) = self
            .store
            .set_deployment_status(&id, DeploymentStatus::InProgress, None)
        {
            error!(deployment = %id, error = %e, "failed to mark deployment in progress");
        }

        let mut failure: Option<String> = None;
        let mut cancelled = false;
        for (number, batch) in batches.iter().enumerate() {
            if token.is_cancelled() {
                cancelled = true;
                failure = Some("cancelled".to_string());
                break;
            }
            info!(deployment = %id, batch = number, clients = ?batch, "deploying batch");

            let results = futures::future::join_all(batch.iter().map(|client| {
                self.deploy_client(&id, client, &request.version, request.health_check_timeout_s)
            }))
            .await;

            let failed: Vec<&str> = batch
                .iter()
                .zip(&results)
                .filter(|(_, healthy)| !**healthy)
                .map(|(name, _)| name.as_str())
                .collect();
            if !failed.is_empty() {
                failure = Some(format!("batch {number} failed for: {}", failed.join(", ")));
                break;
            }
            info!(deployment = %id, batch = number, "batch complete");
        }

        // Re-check cancellation that landed during the final batch.
        if failure.is_none() && token.is_cancelled() {
            cancelled = true;
            failure = Some("cancelled".to_string());
        }

        match failure {
            None => {
                if let Err(e) = self
                    .store
                    .set_deployment_status(&id, DeploymentStatus::Completed, None)
                {
                    error!(deployment = %id, error = %e, "failed to complete deployment");
                }
                info!(deployment = %id, "deployment completed");
            }
            Some(message) => {
                warn!(deployment = %id, error = %message, "deployment failed");
                self.failure_branch(&id, &request, &message, cancelled).await;
            }
        }

        self.active.lock().expect("active lock").remove(&id);
    }

    /// Deploys one client: sync, reload, then the health gate. Returns
    /// true when the client reached `healthy`.
    async fn deploy_client(
        &self,
        id: &str,
        client: &str,
        version: &str,
        health_timeout_s: f64,
    ) -> bool {
        let _ = self.store.set_deployment_client_status(
            id,
            client,
            DeploymentClientStatus::Deploying,
            None,
        );

        if let Err(message) = self.sync(client, version).await {
            let _ = self.store.set_deployment_client_status(
                id,
                client,
                DeploymentClientStatus::Failed,
                Some(&message),
            );
            return false;
        }

        let endpoint = match self.store.resolve_endpoint(client) {
            Ok(Some(endpoint)) => endpoint,
            _ => {
                let _ = self.store.set_deployment_client_status(
                    id,
                    client,
                    DeploymentClientStatus::Failed,
                    Some("client endpoint unknown"),
                );
                return false;
            }
        };
        let (host, port) = endpoint;

        if let Err(e) = self.fleet.reload(&host, port).await {
            let _ = self.store.set_deployment_client_status(
                id,
                client,
                DeploymentClientStatus::Failed,
                Some(&format!("reload: {e}")),
            );
            return false;
        }
        let _ = self.store.set_deployment_client_status(
            id,
            client,
            DeploymentClientStatus::Deployed,
            None,
        );

        if self.await_health(&host, port, health_timeout_s).await {
            let _ = self.store.set_deployment_client_status(
                id,
                client,
                DeploymentClientStatus::Healthy,
                None,
            );
            let _ = self.store.update_client_version(client, version);
            true
        } else {
            let _ = self.store.set_deployment_client_status(
                id,
                client,
                DeploymentClientStatus::Failed,
                Some("health check timeout"),
            );
            false
        }
    }

    async fn await_health(&self, host: &str, port: u16, timeout_s: f64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(timeout_s.max(0.0));
        loop {
            if matches!(self.fleet.health(host, port).await, Ok(true)) {
                return true;
            }
            if tokio::time::Instant::now() + HEALTH_POLL > deadline {
                return false;
            }
            tokio::time::sleep(HEALTH_POLL).await;
        }
    }

    /// A cancelled deployment still rolls back when configured, but it
    /// terminates as `failed` with error "cancelled"; only an organic
    /// batch failure ends in `rolled_back`.
    async fn failure_branch(
        &self,
        id: &str,
        request: &DeploymentRequest,
        message: &str,
        cancelled: bool,
    ) {
        if !request.auto_rollback {
            let _ = self
                .store
                .set_deployment_status(id, DeploymentStatus::Failed, Some(message));
            return;
        }

        let _ = self
            .store
            .set_deployment_status(id, DeploymentStatus::RollingBack, Some(message));
        let clients = self.store.deployment_clients(id).unwrap_or_default();
        for record in clients {
            let touched = matches!(
                record.status,
                DeploymentClientStatus::Deployed
                    | DeploymentClientStatus::Healthy
                    | DeploymentClientStatus::Failed
            );
            let Some(previous) = record.previous_version.as_deref() else {
                continue;
            };
            if !touched {
                continue;
            }
            match self.rollback_client(&record.client_name, previous).await {
                Ok(()) => {
                    let _ = self.store.set_deployment_client_status(
                        id,
                        &record.client_name,
                        DeploymentClientStatus::RolledBack,
                        None,
                    );
                    let _ = self
                        .store
                        .update_client_version(&record.client_name, previous);
                    info!(
                        deployment = id,
                        client = %record.client_name,
                        version = previous,
                        "rolled back client"
                    );
                }
                Err(e) => {
                    error!(
                        deployment = id,
                        client = %record.client_name,
                        error = %e,
                        "rollback failed for client"
                    );
                    let _ = self.store.set_deployment_client_status(
                        id,
                        &record.client_name,
                        DeploymentClientStatus::Failed,
                        Some(&format!("rollback: {e}")),
                    );
                }
            }
        }
        if cancelled {
            let _ = self
                .store
                .set_deployment_status(id, DeploymentStatus::Failed, Some(message));
        } else {
            let _ = self
                .store
                .set_deployment_status(id, DeploymentStatus::RolledBack, None);
        }
    }

    async fn rollback_client(&self, client: &str, version: &str) -> Result<(), String> {
        self.sync(client, version).await?;
        let (host, port) = self
            .store
            .resolve_endpoint(client)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "client endpoint unknown".to_string())?;
        self.fleet
            .reload(&host, port)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Runs the external file-sync procedure. Exit 0 means success; output
    /// is captured for diagnostics.
    async fn sync(&self, client: &str, version: &str) -> Result<(), String> {
        let output = tokio::process::Command::new(&self.deploy_script)
            .args(["--client", client, "--sync-only", "--version", version])
            .output()
            .await
            .map_err(|e| format!("sync spawn failed: {e}"))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout
        } else {
            stderr
        };
        let detail = detail.trim();
        let tail_start = detail.len().saturating_sub(SYNC_OUTPUT_TAIL);
        Err(format!(
            "sync exited with {}: {}",
            output.status.code().unwrap_or(-1),
            &detail[tail_start..]
        ))
    }
}

fn partition_batches(targets: &[String], batch_size: usize) -> Vec<Vec<String>> {
    targets
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn store() -> Arc<FleetStore> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FleetStore::open(&dir.path().join("fleet.db")).unwrap());
        std::mem::forget(dir);
        store
    }

    /// Writes a sync script that logs its argv and succeeds.
    fn sync_script(dir: &std::path::Path) -> (PathBuf, PathBuf) {
        let log = dir.join("sync.log");
        let script = dir.join("deploy.sh");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$@\" >> {}\nexit 0\n", log.display()),
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        (script, log)
    }

    /// Writes a sync script that sleeps before succeeding, keeping a batch
    /// in flight long enough for a cancellation to land.
    fn slow_sync_script(dir: &std::path::Path, delay_s: f64) -> PathBuf {
        let script = dir.join("slow-deploy.sh");
        std::fs::write(&script, format!("#!/bin/sh\nsleep {delay_s}\nexit 0\n")).unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        script
    }

    /// Spawns a fake device API; `healthy` controls the health endpoint.
    async fn fake_device(healthy: Arc<AtomicBool>) -> u16 {
        let app = Router::new()
            .route(
                "/api/health",
                get(move || {
                    let healthy = Arc::clone(&healthy);
                    async move {
                        if healthy.load(Ordering::SeqCst) {
                            (axum::http::StatusCode::OK, Json(json!({"status": "ok"})))
                        } else {
                            (
                                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                                Json(json!({"detail": "not ready"})),
                            )
                        }
                    }
                }),
            )
            .route(
                "/api/reload",
                post(|| async { Json(json!({"success": true, "changes": {}})) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn wait_terminal(store: &Arc<FleetStore>, id: &str) -> DeploymentRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let record = store.get_deployment(id).unwrap().unwrap();
            if record.status.is_terminal() {
                return record;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "deployment never reached a terminal status: {:?}",
                record.status
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[test]
    fn batch_partition_preserves_order() {
        let targets: Vec<String> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let batches = partition_batches(&targets, 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], ["a", "b"]);
        assert_eq!(batches[2], ["e"]);

        // batch_size >= targets means exactly one batch.
        assert_eq!(partition_batches(&targets, 5).len(), 1);
        assert_eq!(partition_batches(&targets, 50).len(), 1);
    }

    #[tokio::test]
    async fn rolling_deploy_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let (script, _log) = sync_script(dir.path());
        let store = store();
        let fleet = Arc::new(FleetClient::new(None));

        let healthy = Arc::new(AtomicBool::new(true));
        for name in ["c1", "c2", "c3", "c4"] {
            let port = fake_device(Arc::clone(&healthy)).await;
            store.upsert_client_endpoint(name, "127.0.0.1", port).unwrap();
            store.update_client_version(name, "1.0.0").unwrap();
        }

        let deployer = Arc::new(Deployer::new(Arc::clone(&store), fleet, script));
        let record = deployer
            .start(DeploymentRequest {
                version: "2.0.0".to_string(),
                target_clients: Some(vec![
                    "c1".to_string(),
                    "c2".to_string(),
                    "c3".to_string(),
                    "c4".to_string(),
                ]),
                batch_size: 2,
                health_check_timeout_s: 10.0,
                auto_rollback: true,
            })
            .await
            .unwrap();

        let done = wait_terminal(&store, &record.id).await;
        assert_eq!(done.status, DeploymentStatus::Completed);
        assert!(done
            .clients
            .iter()
            .all(|c| c.status == DeploymentClientStatus::Healthy));
        assert_eq!(
            store.get_client("c1").unwrap().unwrap().deployed_version.as_deref(),
            Some("2.0.0")
        );
        assert!(done.completed_at >= done.started_at);
    }

    #[tokio::test]
    async fn failed_health_gate_rolls_back_touched_clients() {
        let dir = tempfile::tempdir().unwrap();
        let (script, log) = sync_script(dir.path());
        let store = store();
        let fleet = Arc::new(FleetClient::new(None));

        let ok = Arc::new(AtomicBool::new(true));
        let never_ok = Arc::new(AtomicBool::new(false));
        let p1 = fake_device(Arc::clone(&ok)).await;
        let p2 = fake_device(Arc::clone(&never_ok)).await;
        let p3 = fake_device(Arc::clone(&ok)).await;
        for (name, port) in [("c1", p1), ("c2", p2), ("c3", p3)] {
            store.upsert_client_endpoint(name, "127.0.0.1", port).unwrap();
            store.update_client_version(name, "1.0.0").unwrap();
        }

        let deployer = Arc::new(Deployer::new(Arc::clone(&store), fleet, script));
        let record = deployer
            .start(DeploymentRequest {
                version: "2.0.0".to_string(),
                target_clients: Some(vec![
                    "c1".to_string(),
                    "c2".to_string(),
                    "c3".to_string(),
                ]),
                batch_size: 1,
                health_check_timeout_s: 3.0,
                auto_rollback: true,
            })
            .await
            .unwrap();

        let done = wait_terminal(&store, &record.id).await;
        assert_eq!(done.status, DeploymentStatus::RolledBack);

        let by_name: std::collections::HashMap<_, _> = done
            .clients
            .iter()
            .map(|c| (c.client_name.as_str(), c))
            .collect();
        assert_eq!(by_name["c1"].status, DeploymentClientStatus::RolledBack);
        // c2 failed its health gate and was rolled back to 1.0.0 as well.
        assert_eq!(by_name["c2"].status, DeploymentClientStatus::RolledBack);
        // c3's batch never started.
        assert_eq!(by_name["c3"].status, DeploymentClientStatus::Pending);

        // The sync log shows the rollback re-sync of c1 to 1.0.0.
        let log_text = std::fs::read_to_string(log).unwrap();
        assert!(log_text.contains("--client c1 --sync-only --version 2.0.0"));
        assert!(log_text.contains("--client c1 --sync-only --version 1.0.0"));
        assert!(!log_text.contains("--client c3"));
    }

    #[tokio::test]
    async fn no_rollback_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let (script, _log) = sync_script(dir.path());
        let store = store();
        let fleet = Arc::new(FleetClient::new(None));

        let never_ok = Arc::new(AtomicBool::new(false));
        let port = fake_device(never_ok).await;
        store.upsert_client_endpoint("c1", "127.0.0.1", port).unwrap();

        let deployer = Arc::new(Deployer::new(Arc::clone(&store), fleet, script));
        let record = deployer
            .start(DeploymentRequest {
                version: "2.0.0".to_string(),
                target_clients: Some(vec!["c1".to_string()]),
                batch_size: 1,
                health_check_timeout_s: 2.0,
                auto_rollback: false,
            })
            .await
            .unwrap();

        let done = wait_terminal(&store, &record.id).await;
        assert_eq!(done.status, DeploymentStatus::Failed);
        assert!(done.error.as_deref().unwrap_or("").contains("failed"));
    }

    #[tokio::test]
    async fn start_rejects_empty_targets_and_bad_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        let (script, _log) = sync_script(dir.path());
        let store = store();
        let deployer = Arc::new(Deployer::new(
            Arc::clone(&store),
            Arc::new(FleetClient::new(None)),
            script,
        ));

        let err = deployer
            .start(DeploymentRequest {
                version: "2.0.0".to_string(),
                target_clients: None,
                batch_size: 1,
                health_check_timeout_s: 5.0,
                auto_rollback: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::NoTargets));

        let err = deployer
            .start(DeploymentRequest {
                version: "2.0.0".to_string(),
                target_clients: Some(vec!["c1".to_string()]),
                batch_size: 0,
                health_check_timeout_s: 5.0,
                auto_rollback: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::InvalidBatchSize));
    }

    #[tokio::test]
    async fn cancel_mid_flight_terminates_as_failed_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let script = slow_sync_script(dir.path(), 0.5);
        let store = store();
        let fleet = Arc::new(FleetClient::new(None));

        let healthy = Arc::new(AtomicBool::new(true));
        for name in ["c1", "c2", "c3"] {
            let port = fake_device(Arc::clone(&healthy)).await;
            store.upsert_client_endpoint(name, "127.0.0.1", port).unwrap();
            store.update_client_version(name, "1.0.0").unwrap();
        }

        let deployer = Arc::new(Deployer::new(Arc::clone(&store), fleet, script));
        let record = deployer
            .start(DeploymentRequest {
                version: "2.0.0".to_string(),
                target_clients: Some(vec![
                    "c1".to_string(),
                    "c2".to_string(),
                    "c3".to_string(),
                ]),
                batch_size: 1,
                health_check_timeout_s: 10.0,
                auto_rollback: true,
            })
            .await
            .unwrap();

        // Cancel while the first batch's sync is still sleeping.
        deployer.cancel(&record.id).unwrap();

        let done = wait_terminal(&store, &record.id).await;
        assert_eq!(done.status, DeploymentStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("cancelled"));
        // The batches after the in-flight one never started.
        let by_name: std::collections::HashMap<_, _> = done
            .clients
            .iter()
            .map(|c| (c.client_name.as_str(), c))
            .collect();
        assert_eq!(by_name["c3"].status, DeploymentClientStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_rejected_for_terminal_deployments() {
        let dir = tempfile::tempdir().unwrap();
        let (script, _log) = sync_script(dir.path());
        let store = store();
        let fleet = Arc::new(FleetClient::new(None));

        let healthy = Arc::new(AtomicBool::new(true));
        let port = fake_device(healthy).await;
        store.upsert_client_endpoint("c1", "127.0.0.1", port).unwrap();

        let deployer = Arc::new(Deployer::new(Arc::clone(&store), fleet, script));
        let record = deployer
            .start(DeploymentRequest {
                version: "2.0.0".to_string(),
                target_clients: Some(vec!["c1".to_string()]),
                batch_size: 1,
                health_check_timeout_s: 10.0,
                auto_rollback: false,
            })
            .await
            .unwrap();
        wait_terminal(&store, &record.id).await;

        let err = deployer.cancel(&record.id).unwrap_err();
        assert!(matches!(err, DeployError::NotCancellable { .. }));
        assert!(matches!(
            deployer.cancel("missing").unwrap_err(),
            DeployError::NotFound(_)
        ));
    }
}
