//! Fleet state store: client heartbeats, per-client workload snapshots,
//! and deployment records, backed by sqlite.
//!
//! Deployment mutations run inside transactions so batch progress is
//! atomic under the concurrent per-client tasks of the deployer.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mctl_core::models::{
    ClientOverview, ClientStatus, DeploymentClientRecord, DeploymentClientStatus,
    DeploymentRecord, DeploymentStatus, HeartbeatPayload, SystemMetrics, WorkloadInfo,
};
use mctl_core::models::{RunMode, WorkloadStatus, WorkloadType};
use mctl_core::time::{from_millis, opt_from_millis, opt_to_millis, to_millis};

const SCHEMA_VERSION: i64 = 1;

/// Default port recorded for a client first seen via heartbeat; an
/// inventory entry overrides it.
const DEFAULT_API_PORT: u16 = 9100;

/// Cadence of the background stale sweep.
pub const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
/// A client is `offline` once it has been silent for this multiple of the
/// stale threshold.
const OFFLINE_MULTIPLIER: f64 = 3.0;

#[derive(Debug, thiserror::Error)]
pub enum FleetStoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("fleet store schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
}

/// Repository for fleet client state and deployment records.
pub struct FleetStore {
    conn: Arc<Mutex<Connection>>,
}

impl FleetStore {
    pub fn open(path: &Path) -> Result<Self, FleetStoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), FleetStoreError> {
        let conn = self.conn.lock().expect("fleet store lock");
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                 version INTEGER PRIMARY KEY,
                 name TEXT NOT NULL,
                 applied_at_ms INTEGER NOT NULL
             )",
            [],
        )?;
        let current: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);
        if current > SCHEMA_VERSION {
            return Err(FleetStoreError::SchemaTooNew {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }
        if current < 1 {
            conn.execute_batch(
                "CREATE TABLE fleet_clients (
                     name TEXT PRIMARY KEY,
                     host TEXT NOT NULL,
                     api_port INTEGER NOT NULL,
                     status TEXT NOT NULL,
                     last_seen_ms INTEGER,
                     cpu_percent REAL,
                     memory_used_mb REAL,
                     memory_total_mb REAL,
                     disk_used_gb REAL,
                     disk_total_gb REAL,
                     deployed_version TEXT,
                     updated_at_ms INTEGER NOT NULL
                 );
                 CREATE TABLE fleet_workloads (
                     client_name TEXT NOT NULL,
                     workload_name TEXT NOT NULL,
                     workload_type TEXT NOT NULL,
                     run_mode TEXT NOT NULL,
                     status TEXT NOT NULL,
                     pid INTEGER,
                     run_count INTEGER NOT NULL DEFAULT 0,
                     last_started_ms INTEGER,
                     last_error TEXT,
                     updated_at_ms INTEGER NOT NULL,
                     PRIMARY KEY (client_name, workload_name)
                 );
                 CREATE TABLE deployments (
                     id TEXT PRIMARY KEY,
                     version TEXT NOT NULL,
                     status TEXT NOT NULL,
                     batch_size INTEGER NOT NULL,
                     target_clients TEXT NOT NULL,
                     error TEXT,
                     created_at_ms INTEGER NOT NULL,
                     started_at_ms INTEGER,
                     completed_at_ms INTEGER
                 );
                 CREATE TABLE deployment_clients (
                     deployment_id TEXT NOT NULL,
                     client_name TEXT NOT NULL,
                     batch_number INTEGER NOT NULL,
                     status TEXT NOT NULL,
                     previous_version TEXT,
                     error TEXT,
                     started_at_ms INTEGER,
                     completed_at_ms INTEGER,
                     PRIMARY KEY (deployment_id, client_name)
                 );",
            )?;
            conn.execute(
                "INSERT INTO schema_migrations (version, name, applied_at_ms) VALUES (1, 'baseline_fleet_tables', ?1)",
                params![to_millis(Utc::now())],
            )?;
        }
        Ok(())
    }

    // --- clients ---

    /// Stores a heartbeat: upserts the client row, replaces its workload
    /// snapshots, and prunes workloads the client no longer reports.
    pub fn upsert_heartbeat(
        &self,
        payload: &HeartbeatPayload,
        host: &str,
    ) -> Result<(), FleetStoreError> {
        let mut conn = self.conn.lock().expect("fleet store lock");
        let tx = conn.transaction()?;
        let now = to_millis(Utc::now());

        tx.execute(
            "INSERT INTO fleet_clients
                 (name, host, api_port, status, last_seen_ms, cpu_percent,
                  memory_used_mb, memory_total_mb, disk_used_gb, disk_total_gb,
                  deployed_version, updated_at_ms)
             VALUES (?1, ?2, ?3, 'online', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?4)
             ON CONFLICT(name) DO UPDATE SET
                 host = excluded.host,
                 status = 'online',
                 last_seen_ms = excluded.last_seen_ms,
                 cpu_percent = excluded.cpu_percent,
                 memory_used_mb = excluded.memory_used_mb,
                 memory_total_mb = excluded.memory_total_mb,
                 disk_used_gb = excluded.disk_used_gb,
                 disk_total_gb = excluded.disk_total_gb,
                 deployed_version = excluded.deployed_version,
                 updated_at_ms = excluded.updated_at_ms",
            params![
                payload.client_name,
                host,
                DEFAULT_API_PORT,
                now,
                payload.system.cpu_percent,
                payload.system.memory_used_mb,
                payload.system.memory_total_mb,
                payload.system.disk_used_gb,
                payload.system.disk_total_gb,
                payload.deployed_version,
            ],
        )?;

        for workload in &payload.workloads {
            tx.execute(
                "INSERT INTO fleet_workloads
                     (client_name, workload_name, workload_type, run_mode, status,
                      pid, run_count, last_started_ms, last_error, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(client_name, workload_name) DO UPDATE SET
                     workload_type = excluded.workload_type,
                     run_mode = excluded.run_mode,
                     status = excluded.status,
                     pid = excluded.pid,
                     run_count = excluded.run_count,
                     last_started_ms = excluded.last_started_ms,
                     last_error = excluded.last_error,
                     updated_at_ms = excluded.updated_at_ms",
                params![
                    payload.client_name,
                    workload.name,
                    workload.workload_type.as_str(),
                    workload.run_mode.as_str(),
                    workload.status.as_str(),
                    workload.pid,
                    workload.run_count,
                    opt_to_millis(workload.last_started),
                    workload.last_error,
                    now,
                ],
            )?;
        }

        // Prune workloads no longer reported by this client.
        if payload.workloads.is_empty() {
            tx.execute(
                "DELETE FROM fleet_workloads WHERE client_name = ?1",
                params![payload.client_name],
            )?;
        } else {
            let names: Vec<String> = payload
                .workloads
                .iter()
                .map(|w| w.name.clone())
                .collect();
            let placeholders = names
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!(
                "DELETE FROM fleet_workloads
                 WHERE client_name = ?1 AND workload_name NOT IN ({placeholders})"
            );
            let mut args: Vec<&dyn rusqlite::ToSql> = vec![&payload.client_name];
            for name in &names {
                args.push(name);
            }
            tx.execute(&sql, args.as_slice())?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Registers or updates a client endpoint from the inventory.
    pub fn upsert_client_endpoint(
        &self,
        name: &str,
        host: &str,
        api_port: u16,
    ) -> Result<(), FleetStoreError> {
        let conn = self.conn.lock().expect("fleet store lock");
        conn.execute(
            "INSERT INTO fleet_clients (name, host, api_port, status, updated_at_ms)
             VALUES (?1, ?2, ?3, 'unknown', ?4)
             ON CONFLICT(name) DO UPDATE SET
                 host = excluded.host,
                 api_port = excluded.api_port,
                 updated_at_ms = excluded.updated_at_ms",
            params![name, host, api_port, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    pub fn list_clients(&self) -> Result<Vec<ClientOverview>, FleetStoreError> {
        let conn = self.conn.lock().expect("fleet store lock");
        let mut stmt = conn.prepare(&format!("{CLIENT_OVERVIEW_SQL} GROUP BY c.name ORDER BY c.name"))?;
        let rows = stmt.query_map([], row_to_client_overview)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_client(&self, name: &str) -> Result<Option<ClientOverview>, FleetStoreError> {
        let conn = self.conn.lock().expect("fleet store lock");
        let sql = format!("{CLIENT_OVERVIEW_SQL} WHERE c.name = ?1 GROUP BY c.name");
        Ok(conn
            .query_row(&sql, params![name], row_to_client_overview)
            .optional()?)
    }

    pub fn client_workloads(&self, client: &str) -> Result<Vec<WorkloadInfo>, FleetStoreError> {
        let conn = self.conn.lock().expect("fleet store lock");
        let mut stmt = conn.prepare(
            "SELECT workload_name, workload_type, run_mode, status, pid, run_count,
                    last_started_ms, last_error
             FROM fleet_workloads
             WHERE client_name = ?1
             ORDER BY workload_name",
        )?;
        let rows = stmt.query_map(params![client], row_to_workload_info)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn client_workload(
        &self,
        client: &str,
        workload: &str,
    ) -> Result<Option<WorkloadInfo>, FleetStoreError> {
        let conn = self.conn.lock().expect("fleet store lock");
        Ok(conn
            .query_row(
                "SELECT workload_name, workload_type, run_mode, status, pid, run_count,
                        last_started_ms, last_error
                 FROM fleet_workloads
                 WHERE client_name = ?1 AND workload_name = ?2",
                params![client, workload],
                row_to_workload_info,
            )
            .optional()?)
    }

    pub fn resolve_endpoint(&self, name: &str) -> Result<Option<(String, u16)>, FleetStoreError> {
        let conn = self.conn.lock().expect("fleet store lock");
        Ok(conn
            .query_row(
                "SELECT host, api_port FROM fleet_clients WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u16)),
            )
            .optional()?)
    }

    pub fn update_client_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<(), FleetStoreError> {
        let conn = self.conn.lock().expect("fleet store lock");
        conn.execute(
            "UPDATE fleet_clients SET deployed_version = ?2, updated_at_ms = ?3 WHERE name = ?1",
            params![name, version, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    /// Marks silent clients `stale`, and `offline` after three times the
    /// threshold. Returns `(newly_stale, newly_offline)`.
    pub fn mark_stale_clients(
        &self,
        threshold: Duration,
    ) -> Result<(usize, usize), FleetStoreError> {
        let conn = self.conn.lock().expect("fleet store lock");
        let now = Utc::now();
        let stale_cutoff = to_millis(now) - threshold.as_millis() as i64;
        let offline_cutoff =
            to_millis(now) - (threshold.as_millis() as f64 * OFFLINE_MULTIPLIER) as i64;

        let offline = conn.execute(
            "UPDATE fleet_clients
             SET status = 'offline', updated_at_ms = ?2
             WHERE status IN ('online', 'stale')
               AND last_seen_ms IS NOT NULL AND last_seen_ms < ?1",
            params![offline_cutoff, to_millis(now)],
        )?;
        let stale = conn.execute(
            "UPDATE fleet_clients
             SET status = 'stale', updated_at_ms = ?2
             WHERE status = 'online'
               AND last_seen_ms IS NOT NULL AND last_seen_ms < ?1",
            params![stale_cutoff, to_millis(now)],
        )?;
        Ok((stale, offline))
    }

    #[cfg(test)]
    fn set_last_seen(&self, name: &str, last_seen: chrono::DateTime<Utc>) {
        let conn = self.conn.lock().expect("fleet store lock");
        conn.execute(
            "UPDATE fleet_clients SET last_seen_ms = ?2 WHERE name = ?1",
            params![name, to_millis(last_seen)],
        )
        .unwrap();
    }

    // --- deployments ---

    /// Persists a pending deployment and its per-client records, capturing
    /// each target's `previous_version` in the same transaction.
    pub fn create_deployment(
        &self,
        id: &str,
        version: &str,
        batch_size: usize,
        targets_with_batches: &[(String, u32)],
    ) -> Result<(), FleetStoreError> {
        let mut conn = self.conn.lock().expect("fleet store lock");
        let tx = conn.transaction()?;
        let now = to_millis(Utc::now());
        let target_names: Vec<&str> = targets_with_batches
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        tx.execute(
            "INSERT INTO deployments
                 (id, version, status, batch_size, target_clients, created_at_ms)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5)",
            params![
                id,
                version,
                batch_size as i64,
                serde_json::to_string(&target_names).unwrap_or_else(|_| "[]".to_string()),
                now,
            ],
        )?;
        for (client, batch_number) in targets_with_batches {
            let previous: Option<String> = tx
                .query_row(
                    "SELECT deployed_version FROM fleet_clients WHERE name = ?1",
                    params![client],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            tx.execute(
                "INSERT INTO deployment_clients
                     (deployment_id, client_name, batch_number, status, previous_version)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![id, client, batch_number, previous],
            )?;
        }
        tx.commit()?;
        info!(deployment = id, version, targets = targets_with_batches.len(), "deployment created");
        Ok(())
    }

    pub fn set_deployment_status(
        &self,
        id: &str,
        status: DeploymentStatus,
        error: Option<&str>,
    ) -> Result<(), FleetStoreError> {
        let conn = self.conn.lock().expect("fleet store lock");
        let now = to_millis(Utc::now());
        conn.execute(
            "UPDATE deployments
             SET status = ?2,
                 error = COALESCE(?3, error),
                 started_at_ms = CASE
                     WHEN ?2 = 'in_progress' AND started_at_ms IS NULL THEN ?4
                     ELSE started_at_ms
                 END,
                 completed_at_ms = CASE
                     WHEN ?2 IN ('completed', 'failed', 'rolled_back') THEN ?4
                     ELSE completed_at_ms
                 END
             WHERE id = ?1",
            params![id, status.as_str(), error, now],
        )?;
        debug!(deployment = id, status = status.as_str(), "deployment status");
        Ok(())
    }

    pub fn set_deployment_client_status(
        &self,
        id: &str,
        client: &str,
        status: DeploymentClientStatus,
        error: Option<&str>,
    ) -> Result<(), FleetStoreError> {
        let conn = self.conn.lock().expect("fleet store lock");
        let now = to_millis(Utc::now());
        conn.execute(
            "UPDATE deployment_clients
             SET status = ?3,
                 error = COALESCE(?4, error),
                 started_at_ms = CASE
                     WHEN ?3 = 'deploying' AND started_at_ms IS NULL THEN ?5
                     ELSE started_at_ms
                 END,
                 completed_at_ms = CASE
                     WHEN ?3 IN ('healthy', 'failed', 'rolled_back') THEN ?5
                     ELSE completed_at_ms
                 END
             WHERE deployment_id = ?1 AND client_name = ?2",
            params![id, client, status.as_str(), error, now],
        )?;
        Ok(())
    }

    pub fn get_deployment(&self, id: &str) -> Result<Option<DeploymentRecord>, FleetStoreError> {
        let conn = self.conn.lock().expect("fleet store lock");
        let record = conn
            .query_row(
                "SELECT id, version, status, batch_size, target_clients, error,
                        created_at_ms, started_at_ms, completed_at_ms
                 FROM deployments WHERE id = ?1",
                params![id],
                row_to_deployment,
            )
            .optional()?;
        let Some(mut record) = record else {
            return Ok(None);
        };
        record.clients = Self::deployment_clients_locked(&conn, id)?;
        Ok(Some(record))
    }

    pub fn list_deployments(&self, limit: usize) -> Result<Vec<DeploymentRecord>, FleetStoreError> {
        let conn = self.conn.lock().expect("fleet store lock");
        let mut stmt = conn.prepare(
            "SELECT id, version, status, batch_size, target_clients, error,
                    created_at_ms, started_at_ms, completed_at_ms
             FROM deployments
             ORDER BY created_at_ms DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_deployment)?;
        let mut out = Vec::new();
        for row in rows {
            let mut record = row?;
            record.clients = Self::deployment_clients_locked(&conn, &record.id)?;
            out.push(record);
        }
        Ok(out)
    }

    pub fn deployment_clients(
        &self,
        id: &str,
    ) -> Result<Vec<DeploymentClientRecord>, FleetStoreError> {
        let conn = self.conn.lock().expect("fleet store lock");
        Self::deployment_clients_locked(&conn, id)
    }

    fn deployment_clients_locked(
        conn: &Connection,
        id: &str,
    ) -> Result<Vec<DeploymentClientRecord>, FleetStoreError> {
        let mut stmt = conn.prepare(
            "SELECT client_name, batch_number, status, previous_version, error,
                    started_at_ms, completed_at_ms
             FROM deployment_clients
             WHERE deployment_id = ?1
             ORDER BY batch_number, client_name",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(DeploymentClientRecord {
                client_name: row.get(0)?,
                batch_number: row.get::<_, i64>(1)? as u32,
                status: DeploymentClientStatus::parse(&row.get::<_, String>(2)?)
                    .unwrap_or(DeploymentClientStatus::Pending),
                previous_version: row.get(3)?,
                error: row.get(4)?,
                started_at: opt_from_millis(row.get(5)?),
                completed_at: opt_from_millis(row.get(6)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

const CLIENT_OVERVIEW_SQL: &str = "SELECT c.name, c.host, c.api_port, c.status, c.last_seen_ms,
        c.cpu_percent, c.memory_used_mb, c.memory_total_mb,
        c.disk_used_gb, c.disk_total_gb, c.deployed_version,
        COUNT(w.workload_name) AS workload_count,
        COALESCE(SUM(CASE WHEN w.status = 'running' THEN 1 ELSE 0 END), 0) AS workloads_running,
        COALESCE(SUM(CASE WHEN w.status = 'failed' THEN 1 ELSE 0 END), 0) AS workloads_failed
 FROM fleet_clients c
 LEFT JOIN fleet_workloads w ON w.client_name = c.name";

fn row_to_client_overview(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClientOverview> {
    let cpu: Option<f64> = row.get(5)?;
    let system = cpu.map(|cpu_percent| SystemMetrics {
        cpu_percent,
        memory_used_mb: row.get::<_, Option<f64>>(6).unwrap_or(None).unwrap_or(0.0),
        memory_total_mb: row.get::<_, Option<f64>>(7).unwrap_or(None).unwrap_or(0.0),
        disk_used_gb: row.get::<_, Option<f64>>(8).unwrap_or(None).unwrap_or(0.0),
        disk_total_gb: row.get::<_, Option<f64>>(9).unwrap_or(None).unwrap_or(0.0),
    });
    Ok(ClientOverview {
        name: row.get(0)?,
        host: row.get(1)?,
        api_port: row.get::<_, i64>(2)? as u16,
        status: ClientStatus::parse(&row.get::<_, String>(3)?),
        last_seen: opt_from_millis(row.get(4)?),
        workload_count: row.get::<_, i64>(11)? as u32,
        workloads_running: row.get::<_, i64>(12)? as u32,
        workloads_failed: row.get::<_, i64>(13)? as u32,
        deployed_version: row.get(10)?,
        system,
    })
}

fn row_to_workload_info(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkloadInfo> {
    Ok(WorkloadInfo {
        name: row.get(0)?,
        workload_type: WorkloadType::parse(&row.get::<_, String>(1)?)
            .unwrap_or(WorkloadType::Agent),
        run_mode: RunMode::parse(&row.get::<_, String>(2)?).unwrap_or(RunMode::Forever),
        status: WorkloadStatus::parse(&row.get::<_, String>(3)?)
            .unwrap_or(WorkloadStatus::Registered),
        pid: row.get::<_, Option<i64>>(4)?.map(|pid| pid as u32),
        run_count: row.get::<_, i64>(5)? as u32,
        last_started: opt_from_millis(row.get(6)?),
        last_error: row.get(7)?,
    })
}

fn row_to_deployment(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeploymentRecord> {
    let targets_json: String = row.get(4)?;
    Ok(DeploymentRecord {
        id: row.get(0)?,
        version: row.get(1)?,
        status: DeploymentStatus::parse(&row.get::<_, String>(2)?)
            .unwrap_or(DeploymentStatus::Pending),
        batch_size: row.get::<_, i64>(3)? as usize,
        target_clients: serde_json::from_str(&targets_json).unwrap_or_default(),
        error: row.get(5)?,
        created_at: from_millis(row.get(6)?),
        started_at: opt_from_millis(row.get(7)?),
        completed_at: opt_from_millis(row.get(8)?),
        clients: Vec::new(),
    })
}

/// Background task: marks silent clients stale/offline every ten seconds.
pub async fn run_stale_sweeper(
    store: Arc<FleetStore>,
    threshold: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(STALE_SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        match store.mark_stale_clients(threshold) {
            Ok((stale, offline)) if stale > 0 || offline > 0 => {
                info!(stale, offline, "marked silent clients");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "stale sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn store() -> FleetStore {
        let dir = tempfile::tempdir().unwrap();
        let store = FleetStore::open(&dir.path().join("fleet.db")).unwrap();
        std::mem::forget(dir);
        store
    }

    fn heartbeat(client: &str, workloads: &[&str]) -> HeartbeatPayload {
        HeartbeatPayload {
            client_name: client.to_string(),
            timestamp: Utc::now(),
            deployed_version: Some("1.0.0".to_string()),
            workloads: workloads
                .iter()
                .map(|name| WorkloadInfo {
                    name: name.to_string(),
                    workload_type: WorkloadType::Service,
                    run_mode: RunMode::Forever,
                    status: WorkloadStatus::Running,
                    pid: Some(100),
                    run_count: 1,
                    last_started: Some(Utc::now()),
                    last_error: None,
                })
                .collect(),
            system: SystemMetrics {
                cpu_percent: 12.5,
                memory_used_mb: 256.0,
                memory_total_mb: 1024.0,
                disk_used_gb: 3.0,
                disk_total_gb: 16.0,
            },
        }
    }

    #[test]
    fn heartbeat_upsert_and_overview() {
        let store = store();
        store
            .upsert_heartbeat(&heartbeat("edge-01", &["a", "b"]), "10.0.0.5")
            .unwrap();

        let clients = store.list_clients().unwrap();
        assert_eq!(clients.len(), 1);
        let client = &clients[0];
        assert_eq!(client.name, "edge-01");
        assert_eq!(client.status, ClientStatus::Online);
        assert_eq!(client.workload_count, 2);
        assert_eq!(client.workloads_running, 2);
        assert_eq!(client.deployed_version.as_deref(), Some("1.0.0"));
        assert!(client.system.as_ref().unwrap().cpu_percent > 12.0);

        let workloads = store.client_workloads("edge-01").unwrap();
        assert_eq!(workloads.len(), 2);
        assert!(store.client_workload("edge-01", "a").unwrap().is_some());
        assert!(store.client_workload("edge-01", "zz").unwrap().is_none());
    }

    #[test]
    fn heartbeat_prunes_unreported_workloads() {
        let store = store();
        store
            .upsert_heartbeat(&heartbeat("edge-01", &["a", "b"]), "10.0.0.5")
            .unwrap();
        store
            .upsert_heartbeat(&heartbeat("edge-01", &["b"]), "10.0.0.5")
            .unwrap();
        let workloads = store.client_workloads("edge-01").unwrap();
        assert_eq!(workloads.len(), 1);
        assert_eq!(workloads[0].name, "b");
    }

    #[test]
    fn stale_then_offline_transitions() {
        let store = store();
        store
            .upsert_heartbeat(&heartbeat("edge-01", &[]), "10.0.0.5")
            .unwrap();

        // Recent heartbeat: untouched.
        let (stale, offline) = store
            .mark_stale_clients(Duration::from_secs(90))
            .unwrap();
        assert_eq!((stale, offline), (0, 0));

        // Older than the threshold: stale.
        store.set_last_seen("edge-01", Utc::now() - ChronoDuration::seconds(120));
        let (stale, _) = store.mark_stale_clients(Duration::from_secs(90)).unwrap();
        assert_eq!(stale, 1);
        assert_eq!(
            store.get_client("edge-01").unwrap().unwrap().status,
            ClientStatus::Stale
        );

        // Older than three times the threshold: offline.
        store.set_last_seen("edge-01", Utc::now() - ChronoDuration::seconds(300));
        let (_, offline) = store.mark_stale_clients(Duration::from_secs(90)).unwrap();
        assert_eq!(offline, 1);
        assert_eq!(
            store.get_client("edge-01").unwrap().unwrap().status,
            ClientStatus::Offline
        );
    }

    #[test]
    fn deployment_round_trip_with_previous_versions() {
        let store = store();
        store
            .upsert_heartbeat(&heartbeat("edge-01", &[]), "10.0.0.5")
            .unwrap();
        store.upsert_client_endpoint("edge-02", "10.0.0.6", 9100).unwrap();

        store
            .create_deployment(
                "dep-1",
                "2.0.0",
                1,
                &[("edge-01".to_string(), 0), ("edge-02".to_string(), 1)],
            )
            .unwrap();

        let record = store.get_deployment("dep-1").unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Pending);
        assert_eq!(record.target_clients, vec!["edge-01", "edge-02"]);
        assert_eq!(record.clients.len(), 2);
        assert_eq!(record.clients[0].previous_version.as_deref(), Some("1.0.0"));
        assert_eq!(record.clients[1].previous_version, None);

        store
            .set_deployment_status("dep-1", DeploymentStatus::InProgress, None)
            .unwrap();
        store
            .set_deployment_client_status(
                "dep-1",
                "edge-01",
                DeploymentClientStatus::Healthy,
                None,
            )
            .unwrap();
        store
            .set_deployment_status("dep-1", DeploymentStatus::Completed, None)
            .unwrap();

        let record = store.get_deployment("dep-1").unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Completed);
        assert!(record.started_at.is_some());
        assert!(record.completed_at.is_some());
        assert!(record.completed_at >= record.started_at);
        assert!(record.started_at.unwrap() >= record.created_at);
        assert_eq!(record.clients[0].status, DeploymentClientStatus::Healthy);
        assert!(record.clients[0].completed_at.is_some());

        assert!(store.get_deployment("missing").unwrap().is_none());
        let recent = store.list_deployments(10).unwrap();
        assert_eq!(recent.len(), 1);
    }
}
