//! Embedded sqlite store for workload state snapshots and run history.
//!
//! Writes are asynchronous and best-effort: supervisors enqueue
//! [`StateWrite`] entries onto a bounded queue drained by a single writer
//! task. On overflow the oldest entry is dropped and a counter incremented,
//! so a slow disk can never block a supervisor state transition.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mctl_core::models::{RunMode, RunRecord, WorkloadState, WorkloadType};
use mctl_core::time::{from_millis, opt_from_millis, opt_to_millis, to_millis};

const SCHEMA_VERSION: i64 = 1;

/// Default bound on the pending write queue.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("state store schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
}

/// A single deferred mutation.
#[derive(Debug)]
pub enum StateWrite {
    UpsertState {
        name: String,
        workload_type: WorkloadType,
        run_mode: RunMode,
        version: Option<String>,
        state: WorkloadState,
    },
    AppendRun(RunRecord),
    DeleteState { name: String },
}

struct WriteQueue {
    buf: Mutex<VecDeque<StateWrite>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl WriteQueue {
    fn push(&self, write: StateWrite) {
        {
            let mut buf = self.buf.lock().expect("write queue lock");
            if buf.len() >= self.capacity {
                buf.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buf.push_back(write);
        }
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<StateWrite> {
        let mut buf = self.buf.lock().expect("write queue lock");
        buf.drain(..).collect()
    }
}

/// Workload fields seeded from a previous daemon run.
#[derive(Clone, Debug)]
pub struct PersistedWorkload {
    pub name: String,
    pub run_count: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub version: Option<String>,
}

/// Cloneable producer half of the store: enqueues writes without blocking.
#[derive(Clone)]
pub struct StateStoreHandle {
    queue: Arc<WriteQueue>,
}

impl StateStoreHandle {
    pub fn enqueue(&self, write: StateWrite) {
        self.queue.push(write);
    }

    /// A handle that discards every write; used by tests that do not care
    /// about persistence.
    pub fn discard() -> Self {
        Self {
            queue: Arc::new(WriteQueue {
                buf: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
                dropped: AtomicU64::new(0),
            }),
        }
    }
}

/// Owner of the sqlite connection and the write queue.
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
    queue: Arc<WriteQueue>,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_capacity(path, DEFAULT_WRITE_QUEUE_CAPACITY)
    }

    pub fn open_with_capacity(path: &Path, capacity: usize) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            queue: Arc::new(WriteQueue {
                buf: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity,
                dropped: AtomicU64::new(0),
            }),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("state store lock");
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
            return Err(StoreError::SchemaTooNew {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }
        if current < 1 {
            conn.execute_batch(
                "CREATE TABLE workload_state (
                     name TEXT PRIMARY KEY,
                     workload_type TEXT NOT NULL,
                     run_mode TEXT NOT NULL,
                     status TEXT NOT NULL,
                     pid INTEGER,
                     run_count INTEGER NOT NULL DEFAULT 0,
                     consecutive_failures INTEGER NOT NULL DEFAULT 0,
                     version TEXT,
                     last_started_ms INTEGER,
                     last_stopped_ms INTEGER,
                     last_heartbeat_ms INTEGER,
                     last_error TEXT,
                     updated_at_ms INTEGER NOT NULL
                 );
                 CREATE TABLE run_history (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     workload_name TEXT NOT NULL,
                     started_at_ms INTEGER NOT NULL,
                     finished_at_ms INTEGER,
                     exit_code INTEGER,
                     error_message TEXT,
                     duration_ms INTEGER
                 );
                 CREATE INDEX idx_run_history_workload
                     ON run_history (workload_name, started_at_ms);",
            )?;
            conn.execute(
                "INSERT INTO schema_migrations (version, name, applied_at_ms) VALUES (1, 'baseline_state_tables', ?1)",
                params![to_millis(Utc::now())],
            )?;
        }
        Ok(())
    }

    pub fn handle(&self) -> StateStoreHandle {
        StateStoreHandle {
            queue: Arc::clone(&self.queue),
        }
    }

    /// Number of writes dropped due to queue overflow.
    pub fn dropped_writes(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Drains the queue until cancelled, then flushes whatever remains.
    pub async fn run_writer(&self, shutdown: CancellationToken) {
        loop {
            let batch = self.queue.drain();
            if batch.is_empty() {
                tokio::select! {
                    _ = self.queue.notify.notified() => continue,
                    _ = shutdown.cancelled() => break,
                }
            }
            self.apply_batch(batch);
        }
        self.apply_batch(self.queue.drain());
        debug!("state store writer stopped");
    }

    fn apply_batch(&self, batch: Vec<StateWrite>) {
        for write in batch {
            if let Err(e) = self.apply(&write) {
                warn!(error = %e, "state store write failed");
            }
        }
    }

    fn apply(&self, write: &StateWrite) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("state store lock");
        match write {
            StateWrite::UpsertState {
                name,
                workload_type,
                run_mode,
                version,
                state,
            } => {
                conn.execute(
                    "INSERT INTO workload_state
                         (name, workload_type, run_mode, status, pid, run_count,
                          consecutive_failures, version, last_started_ms, last_stopped_ms,
                          last_heartbeat_ms, last_error, updated_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(name) DO UPDATE SET
                         workload_type = excluded.workload_type,
                         run_mode = excluded.run_mode,
                         status = excluded.status,
                         pid = excluded.pid,
                         run_count = excluded.run_count,
                         consecutive_failures = excluded.consecutive_failures,
                         version = excluded.version,
                         last_started_ms = excluded.last_started_ms,
                         last_stopped_ms = excluded.last_stopped_ms,
                         last_heartbeat_ms = excluded.last_heartbeat_ms,
                         last_error = excluded.last_error,
                         updated_at_ms = excluded.updated_at_ms",
                    params![
                        name,
                        workload_type.as_str(),
                        run_mode.as_str(),
                        state.status.as_str(),
                        state.pid,
                        state.run_count,
                        state.consecutive_failures,
                        version,
                        opt_to_millis(state.last_started),
                        opt_to_millis(state.last_stopped),
                        opt_to_millis(state.last_heartbeat),
                        state.last_error,
                        to_millis(Utc::now()),
                    ],
                )?;
            }
            StateWrite::AppendRun(record) => {
                conn.execute(
                    "INSERT INTO run_history
                         (workload_name, started_at_ms, finished_at_ms, exit_code,
                          error_message, duration_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        record.workload_name,
                        to_millis(record.started_at),
                        opt_to_millis(record.finished_at),
                        record.exit_code,
                        record.error_message,
                        record.duration_ms,
                    ],
                )?;
            }
            StateWrite::DeleteState { name } => {
                conn.execute("DELETE FROM workload_state WHERE name = ?1", params![name])?;
            }
        }
        Ok(())
    }

    /// Loads persisted snapshots used to seed `run_count`, the backoff
    /// streak, `last_error`, and `version` on boot. Status is never
    /// restored as running; the supervisor re-derives it.
    pub fn load_states(&self) -> Result<Vec<PersistedWorkload>, StoreError> {
        let conn = self.conn.lock().expect("state store lock");
        let mut stmt = conn.prepare(
            "SELECT name, run_count, consecutive_failures, last_error, version
             FROM workload_state",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PersistedWorkload {
                name: row.get(0)?,
                run_count: row.get::<_, i64>(1)? as u32,
                consecutive_failures: row.get::<_, i64>(2)? as u32,
                last_error: row.get(3)?,
                version: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Recent runs for one workload, newest first.
    pub fn run_history(&self, name: &str, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let conn = self.conn.lock().expect("state store lock");
        let mut stmt = conn.prepare(
            "SELECT workload_name, started_at_ms, finished_at_ms, exit_code,
                    error_message, duration_ms
             FROM run_history
             WHERE workload_name = ?1
             ORDER BY started_at_ms DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![name, limit as i64], |row| {
            Ok(RunRecord {
                workload_name: row.get(0)?,
                started_at: from_millis(row.get(1)?),
                finished_at: opt_from_millis(row.get(2)?),
                exit_code: row.get(3)?,
                error_message: row.get(4)?,
                duration_ms: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Total recorded runs for one workload.
    pub fn run_count(&self, name: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock().expect("state store lock");
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM run_history WHERE workload_name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Ok(count as u64)
    }
}
