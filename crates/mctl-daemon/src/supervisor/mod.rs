//! Per-workload supervisor: child process lifecycle and run-mode policy.
//!
//! Each supervisor owns exactly one workload. `start` spawns a supervision
//! task that launches the worker process, waits for it (with an optional
//! wall-clock timeout), records a run, and applies the run-mode policy:
//! `forever` restarts with exponential backoff on repeated failure,
//! `n_times` restarts until `max_runs` and then completes, `schedule` never
//! restarts (the next firing comes from the scheduler).

pub mod limits;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mctl_core::models::{
    RunMode, RunRecord, WorkloadInfo, WorkloadSpec, WorkloadState, WorkloadStatus,
};

use crate::state_store::{StateStoreHandle, StateWrite};

/// Default graceful-stop window.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);
/// Grace applied when a run overruns its `timeout_s`.
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);
/// Window granted after the kill signal before giving up on the wait.
const KILL_WAIT: Duration = Duration::from_secs(2);
/// Liveness poll cadence during the graceful-stop window.
const STOP_POLL: Duration = Duration::from_millis(100);
/// Ceiling for the failure backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(300);
/// How much of the child's stderr is retained for `last_error`.
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("workload '{name}' is already {current}", current = .status.as_str())]
    AlreadyActive {
        name: String,
        status: WorkloadStatus,
    },
}

/// Shared wiring every supervisor needs.
pub struct SupervisorContext {
    pub store: StateStoreHandle,
    pub worker_exe: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub shutdown: CancellationToken,
}

struct RunHandle {
    cancel: CancellationToken,
    grace_ms: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

/// Owns the lifecycle of a single workload's child process.
pub struct Supervisor {
    name: String,
    spec: RwLock<Arc<WorkloadSpec>>,
    state: Mutex<WorkloadState>,
    lifecycle: tokio::sync::Mutex<()>,
    run: Mutex<Option<RunHandle>>,
    ctx: Arc<SupervisorContext>,
}

impl Supervisor {
    pub fn new(spec: WorkloadSpec, ctx: Arc<SupervisorContext>) -> Arc<Self> {
        Arc::new(Self {
            name: spec.name.clone(),
            spec: RwLock::new(Arc::new(spec)),
            state: Mutex::new(WorkloadState::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            run: Mutex::new(None),
            ctx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> Arc<WorkloadSpec> {
        self.spec.read().expect("spec lock").clone()
    }

    /// In-place spec swap preserving the supervisor instance.
    pub fn replace_spec(&self, spec: WorkloadSpec) {
        *self.spec.write().expect("spec lock") = Arc::new(spec);
    }

    /// Seeds fields recovered from the state store on boot. The backoff
    /// streak survives a daemon restart so a crash-looping workload does
    /// not come back with a reset delay.
    pub fn seed(&self, run_count: u32, consecutive_failures: u32, last_error: Option<String>) {
        let mut state = self.state.lock().expect("state lock");
        state.run_count = run_count;
        state.consecutive_failures = consecutive_failures;
        state.last_error = last_error;
    }

    pub fn state_snapshot(&self) -> WorkloadState {
        self.state.lock().expect("state lock").clone()
    }

    pub fn info(&self) -> WorkloadInfo {
        let spec = self.spec();
        let state = self.state_snapshot();
        WorkloadInfo {
            name: spec.name.clone(),
            workload_type: spec.workload_type,
            run_mode: spec.run_mode,
            status: state.status,
            pid: state.pid,
            run_count: state.run_count,
            last_started: state.last_started,
            last_error: state.last_error,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state.lock().expect("state lock").status,
            WorkloadStatus::Starting | WorkloadStatus::Running | WorkloadStatus::Stopping
        )
    }

    /// Spawns a new supervision run. Fails when a run is already active.
    pub async fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked()
    }

    /// Stops the current run via the polite-then-forced protocol.
    /// Idempotent when nothing is running.
    pub async fn stop(&self, grace: Duration) {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(grace).await;
    }

    /// `stop` then `start`, atomic with respect to other callers.
    pub async fn restart(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(DEFAULT_GRACE).await;
        self.start_locked()
    }

    fn start_locked(self: &Arc<Self>) -> Result<(), SupervisorError> {
        {
            let mut state = self.state.lock().expect("state lock");
            if !state.status.is_startable() {
                return Err(SupervisorError::AlreadyActive {
                    name: self.name.clone(),
                    status: state.status,
                });
            }
            state.status = WorkloadStatus::Starting;
        }
        self.persist();

        let cancel = self.ctx.shutdown.child_token();
        let grace_ms = Arc::new(AtomicU64::new(DEFAULT_GRACE.as_millis() as u64));
        let task = tokio::spawn(Arc::clone(self).supervise(cancel.clone(), Arc::clone(&grace_ms)));
        *self.run.lock().expect("run lock") = Some(RunHandle {
            cancel,
            grace_ms,
            task,
        });
        Ok(())
    }

    async fn stop_locked(&self, grace: Duration) {
        let handle = self.run.lock().expect("run lock").take();
        let Some(handle) = handle else {
            return;
        };
        {
            let mut state = self.state.lock().expect("state lock");
            if matches!(
                state.status,
                WorkloadStatus::Starting | WorkloadStatus::Running
            ) {
                state.status = WorkloadStatus::Stopping;
            }
        }
        self.persist();
        handle
            .grace_ms
            .store(grace.as_millis() as u64, Ordering::SeqCst);
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            warn!(workload = %self.name, error = %e, "supervision task join failed");
        }
    }

    /// Called by the health monitor when the recorded pid no longer names a
    /// live process.
    pub fn mark_process_lost(&self) {
        let changed = {
            let mut state = self.state.lock().expect("state lock");
            if state.status == WorkloadStatus::Running {
                state.status = WorkloadStatus::Failed;
                state.last_error = Some("process disappeared".to_string());
                state.pid = None;
                true
            } else {
                false
            }
        };
        if changed {
            warn!(workload = %self.name, "process disappeared");
            self.persist();
        }
    }

    fn persist(&self) {
        let spec = self.spec();
        let state = self.state_snapshot();
        self.ctx.store.enqueue(StateWrite::UpsertState {
            name: spec.name.clone(),
            workload_type: spec.workload_type,
            run_mode: spec.run_mode,
            version: spec.version.clone(),
            state,
        });
    }

    fn spawn_child(&self, spec: &WorkloadSpec) -> std::io::Result<Child> {
        let params = serde_json::to_string(&spec.params).unwrap_or_else(|_| "{}".to_string());
        let mut cmd = Command::new(&self.ctx.worker_exe);
        cmd.env("MCTL_WORKLOAD", &spec.name)
            .env("MCTL_MODULE", &spec.module)
            .env("MCTL_ENTRY_POINT", &spec.entry_point)
            .env("MCTL_PARAMS", params)
            .stdin(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        match self.open_log_file() {
            Some(file) => cmd.stdout(std::process::Stdio::from(file)),
            None => cmd.stdout(std::process::Stdio::null()),
        };

        let memory_limit_mb = spec.memory_limit_mb;
        let cpu_nice = spec.cpu_nice;
        if memory_limit_mb.is_some() || cpu_nice.is_some() {
            unsafe {
                cmd.pre_exec(move || limits::apply(memory_limit_mb, cpu_nice));
            }
        }
        cmd.spawn()
    }

    fn open_log_file(&self) -> Option<std::fs::File> {
        let dir = self.ctx.log_dir.as_ref()?;
        if std::fs::create_dir_all(dir).is_err() {
            return None;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.log", self.name)))
            .ok()
    }

    async fn supervise(self: Arc<Self>, cancel: CancellationToken, grace_ms: Arc<AtomicU64>) {
        loop {
            if cancel.is_cancelled() {
                self.finish_stopped();
                return;
            }
            let spec = self.spec();

            let mut child = match self.spawn_child(&spec) {
                Ok(child) => child,
                Err(e) => {
                    let message = format!("spawn failed: {e}");
                    warn!(workload = %self.name, error = %e, "workload spawn failed");
                    {
                        let mut state = self.state.lock().expect("state lock");
                        state.status = WorkloadStatus::Failed;
                        state.last_error = Some(message);
                        state.pid = None;
                    }
                    self.persist();
                    return;
                }
            };
            let pid = child.id().unwrap_or_default();
            let started_at = Utc::now();
            let run_count = {
                let mut state = self.state.lock().expect("state lock");
                state.status = WorkloadStatus::Running;
                state.pid = Some(pid);
                state.last_started = Some(started_at);
                state.run_count += 1;
                state.run_count
            };
            self.persist();
            info!(workload = %self.name, pid, run_count, "workload started");

            let tail = Arc::new(Mutex::new(Vec::new()));
            let stderr_pump = child.stderr.take().map(|stderr| {
                tokio::spawn(pump_stderr(
                    stderr,
                    self.open_log_file(),
                    Arc::clone(&tail),
                ))
            });

            let outcome = self.wait_for_exit(&mut child, &spec, &cancel, &grace_ms).await;

            let finished_at = Utc::now();
            let duration = finished_at - started_at;
            if let Some(pump) = stderr_pump {
                let _ = pump.await;
            }
            drop(child);

            let stderr_tail = {
                let bytes = tail.lock().expect("stderr tail lock");
                String::from_utf8_lossy(&bytes).trim().to_string()
            };

            let stop_requested = matches!(outcome, WaitOutcome::Cancelled(_));
            let (exit_code, clean, error_message) = match &outcome {
                WaitOutcome::Exited(code) => {
                    let clean = *code == Some(0);
                    let error = if clean {
                        None
                    } else if !stderr_tail.is_empty() {
                        Some(stderr_tail.clone())
                    } else {
                        Some(match code {
                            Some(c) => format!("exited with code {c}"),
                            None => "killed by signal".to_string(),
                        })
                    };
                    (*code, clean, error)
                }
                WaitOutcome::TimedOut(code) => (*code, false, Some("timeout".to_string())),
                WaitOutcome::Cancelled(code) => (*code, true, None),
            };

            self.ctx.store.enqueue(StateWrite::AppendRun(RunRecord {
                workload_name: self.name.clone(),
                started_at,
                finished_at: Some(finished_at),
                exit_code,
                error_message: error_message.clone(),
                duration_ms: Some(duration.num_milliseconds()),
            }));

            {
                let mut state = self.state.lock().expect("state lock");
                state.pid = None;
                if !clean {
                    state.last_error = error_message.clone();
                }
            }

            if stop_requested {
                self.finish_stopped();
                return;
            }

            if !clean {
                warn!(
                    workload = %self.name,
                    exit_code = ?exit_code,
                    error = error_message.as_deref().unwrap_or(""),
                    "workload exited with error"
                );
            } else {
                info!(workload = %self.name, "workload exited cleanly");
            }

            // Backoff accounting: a run that outlived its restart delay
            // counts as a recovery even if it eventually failed.
            let failures = {
                let mut state = self.state.lock().expect("state lock");
                if clean {
                    state.consecutive_failures = 0;
                } else if duration.num_milliseconds() as f64 > spec.restart_delay_s * 1000.0 {
                    state.consecutive_failures = 1;
                } else {
                    state.consecutive_failures += 1;
                }
                state.consecutive_failures
            };

            // Run-mode policy.
            if spec.run_mode == RunMode::NTimes
                && run_count >= spec.max_runs.unwrap_or(1)
            {
                {
                    let mut state = self.state.lock().expect("state lock");
                    state.status = WorkloadStatus::Completed;
                }
                self.persist();
                info!(workload = %self.name, run_count, "workload completed all runs");
                return;
            }

            let restart = match spec.run_mode {
                RunMode::Forever => true,
                RunMode::NTimes => true,
                RunMode::Schedule => false,
            };

            if !restart {
                {
                    let mut state = self.state.lock().expect("state lock");
                    state.status = if clean {
                        WorkloadStatus::Stopped
                    } else {
                        WorkloadStatus::Failed
                    };
                    if clean {
                        state.last_stopped = Some(finished_at);
                    }
                }
                self.persist();
                return;
            }

            {
                let mut state = self.state.lock().expect("state lock");
                state.status = if clean {
                    WorkloadStatus::Starting
                } else {
                    WorkloadStatus::Failed
                };
            }
            self.persist();

            let delay = backoff_delay(spec.restart_delay_s, failures);
            info!(
                workload = %self.name,
                delay_s = delay.as_secs_f64(),
                "restarting workload"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    self.finish_stopped();
                    return;
                }
            }
            {
                let mut state = self.state.lock().expect("state lock");
                state.status = WorkloadStatus::Starting;
            }
            self.persist();
        }
    }

    async fn wait_for_exit(
        &self,
        child: &mut Child,
        spec: &WorkloadSpec,
        cancel: &CancellationToken,
        grace_ms: &AtomicU64,
    ) -> WaitOutcome {
        enum Interrupt {
            Exited(Option<i32>),
            TimedOut,
            Cancelled,
        }

        let timeout = spec.timeout_s.map(Duration::from_secs_f64);
        let overrun = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };

        // The wait future borrows the child; terminate below needs it
        // again, so the select only decides which path was taken.
        let interrupt = tokio::select! {
            result = child.wait() => {
                Interrupt::Exited(result.ok().and_then(|status| status.code()))
            }
            _ = overrun => Interrupt::TimedOut,
            _ = cancel.cancelled() => Interrupt::Cancelled,
        };

        match interrupt {
            Interrupt::Exited(code) => WaitOutcome::Exited(code),
            Interrupt::TimedOut => {
                warn!(workload = %self.name, timeout_s = ?spec.timeout_s, "workload timed out");
                let code = terminate(child, TIMEOUT_GRACE).await;
                WaitOutcome::TimedOut(code)
            }
            Interrupt::Cancelled => {
                let grace = Duration::from_millis(grace_ms.load(Ordering::SeqCst));
                let code = terminate(child, grace).await;
                WaitOutcome::Cancelled(code)
            }
        }
    }

    fn finish_stopped(&self) {
        {
            let mut state = self.state.lock().expect("state lock");
            state.status = WorkloadStatus::Stopped;
            state.last_stopped = Some(Utc::now());
            state.pid = None;
        }
        self.persist();
        info!(workload = %self.name, "workload stopped");
    }
}

enum WaitOutcome {
    /// The child exited on its own; `None` means killed by a signal.
    Exited(Option<i32>),
    TimedOut(Option<i32>),
    Cancelled(Option<i32>),
}

/// Polite-then-forced termination: SIGTERM, poll up to `grace`, SIGKILL,
/// wait up to two more seconds.
async fn terminate(child: &mut Child, grace: Duration) -> Option<i32> {
    if let Some(pid) = child.id() {
        unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    }
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.code(),
            Ok(None) => {}
            Err(_) => break,
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(STOP_POLL).await;
    }
    let _ = child.start_kill();
    match tokio::time::timeout(KILL_WAIT, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        _ => None,
    }
}

/// `restart_delay × 2^(failures−1)`, capped at five minutes.
fn backoff_delay(restart_delay_s: f64, consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return Duration::from_secs_f64(restart_delay_s.max(0.0));
    }
    let exponent = (consecutive_failures - 1).min(31);
    let delay = restart_delay_s.max(0.0) * 2f64.powi(exponent as i32);
    Duration::from_secs_f64(delay.min(MAX_BACKOFF.as_secs_f64()))
}

async fn pump_stderr(
    mut stderr: ChildStderr,
    log_file: Option<std::fs::File>,
    tail: Arc<Mutex<Vec<u8>>>,
) {
    let mut writer = log_file.map(tokio::fs::File::from_std);
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Some(w) = writer.as_mut() {
                    let _ = w.write_all(&buf[..n]).await;
                }
                let mut bytes = tail.lock().expect("stderr tail lock");
                bytes.extend_from_slice(&buf[..n]);
                if bytes.len() > STDERR_TAIL_BYTES {
                    let excess = bytes.len() - STDERR_TAIL_BYTES;
                    bytes.drain(..excess);
                }
            }
        }
    }
    if let Some(mut w) = writer {
        let _ = w.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::StateStoreHandle;
    use mctl_core::models::WorkloadType;
    use std::collections::{BTreeMap, BTreeSet};
    use std::os::unix::fs::PermissionsExt;

    /// Writes a worker shim that executes the module string as a shell
    /// script, mirroring how the real worker dispatches on MCTL_MODULE.
    fn shell_worker(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("worker.sh");
        std::fs::write(&path, "#!/bin/sh\nexec sh -c \"$MCTL_MODULE\"\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: Arc<SupervisorContext>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(SupervisorContext {
            store: StateStoreHandle::discard(),
            worker_exe: shell_worker(dir.path()),
            log_dir: None,
            shutdown: CancellationToken::new(),
        });
        Fixture { _dir: dir, ctx }
    }

    fn spec(name: &str, run_mode: RunMode, script: &str) -> WorkloadSpec {
        WorkloadSpec {
            name: name.to_string(),
            workload_type: WorkloadType::Service,
            run_mode,
            module: script.to_string(),
            entry_point: "run".to_string(),
            params: BTreeMap::new(),
            version: None,
            schedule: None,
            max_runs: None,
            restart_delay_s: 0.05,
            timeout_s: None,
            memory_limit_mb: None,
            cpu_nice: None,
            tags: BTreeSet::new(),
        }
    }

    async fn wait_for<F: Fn(&WorkloadState) -> bool>(
        sup: &Arc<Supervisor>,
        timeout: Duration,
        predicate: F,
    ) -> WorkloadState {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = sup.state_snapshot();
            if predicate(&state) {
                return state;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting; last state: {state:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn backoff_follows_doubling_curve() {
        assert_eq!(backoff_delay(1.0, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1.0, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(1.0, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(1.0, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(1.0, 5), Duration::from_secs(16));
        assert_eq!(backoff_delay(1.0, 31), Duration::from_secs(300));
    }

    #[test]
    fn backoff_caps_at_300s_after_about_nine_failures() {
        assert_eq!(backoff_delay(1.0, 9), Duration::from_secs(256));
        assert_eq!(backoff_delay(1.0, 10), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn n_times_completes_after_max_runs() {
        let fx = fixture();
        let mut s = spec("three", RunMode::NTimes, "exit 0");
        s.max_runs = Some(3);
        let sup = Supervisor::new(s, fx.ctx);
        sup.start().await.unwrap();

        let state = wait_for(&sup, Duration::from_secs(5), |s| {
            s.status == WorkloadStatus::Completed
        })
        .await;
        assert_eq!(state.run_count, 3);
        assert!(state.pid.is_none());
    }

    #[tokio::test]
    async fn max_runs_of_one_completes_after_a_single_run() {
        let fx = fixture();
        let mut s = spec("once", RunMode::NTimes, "exit 0");
        s.max_runs = Some(1);
        let sup = Supervisor::new(s, fx.ctx);
        sup.start().await.unwrap();

        let state = wait_for(&sup, Duration::from_secs(5), |s| {
            s.status == WorkloadStatus::Completed
        })
        .await;
        assert_eq!(state.run_count, 1);
    }

    #[tokio::test]
    async fn forever_failure_increments_consecutive_failures() {
        let fx = fixture();
        let sup = Supervisor::new(spec("crashy", RunMode::Forever, "exit 1"), fx.ctx);
        sup.start().await.unwrap();

        wait_for(&sup, Duration::from_secs(5), |s| s.consecutive_failures >= 3).await;
        sup.stop(Duration::from_secs(1)).await;
        let state = sup.state_snapshot();
        assert_eq!(state.status, WorkloadStatus::Stopped);
    }

    #[tokio::test]
    async fn stderr_tail_lands_in_last_error() {
        let fx = fixture();
        let sup = Supervisor::new(
            spec("boom", RunMode::Schedule, "echo kaboom >&2; exit 3"),
            fx.ctx,
        );
        sup.start().await.unwrap();

        let state = wait_for(&sup, Duration::from_secs(5), |s| {
            s.status == WorkloadStatus::Failed
        })
        .await;
        assert!(state.last_error.as_deref().unwrap_or("").contains("kaboom"));
    }

    #[tokio::test]
    async fn timeout_records_timeout_error() {
        let fx = fixture();
        let mut s = spec("slow", RunMode::Schedule, "sleep 30");
        s.timeout_s = Some(0.2);
        let sup = Supervisor::new(s, fx.ctx);
        sup.start().await.unwrap();

        let state = wait_for(&sup, Duration::from_secs(10), |s| {
            s.status == WorkloadStatus::Failed
        })
        .await;
        assert_eq!(state.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let fx = fixture();
        let sup = Supervisor::new(spec("svc", RunMode::Forever, "sleep 30"), fx.ctx);
        sup.start().await.unwrap();
        wait_for(&sup, Duration::from_secs(5), |s| {
            s.status == WorkloadStatus::Running
        })
        .await;

        sup.stop(Duration::from_secs(1)).await;
        assert_eq!(sup.state_snapshot().status, WorkloadStatus::Stopped);
        sup.stop(Duration::from_secs(1)).await;
        assert_eq!(sup.state_snapshot().status, WorkloadStatus::Stopped);
        assert!(sup.state_snapshot().last_stopped.is_some());
    }

    #[tokio::test]
    async fn restart_yields_a_fresh_pid() {
        let fx = fixture();
        let sup = Supervisor::new(spec("svc", RunMode::Forever, "sleep 30"), fx.ctx);
        sup.start().await.unwrap();
        let before = wait_for(&sup, Duration::from_secs(5), |s| {
            s.status == WorkloadStatus::Running
        })
        .await;

        sup.restart().await.unwrap();
        let after = wait_for(&sup, Duration::from_secs(5), |s| {
            s.status == WorkloadStatus::Running
        })
        .await;
        assert_ne!(before.pid, after.pid);
        sup.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn start_rejected_while_running() {
        let fx = fixture();
        let sup = Supervisor::new(spec("svc", RunMode::Forever, "sleep 30"), fx.ctx);
        sup.start().await.unwrap();
        wait_for(&sup, Duration::from_secs(5), |s| {
            s.status == WorkloadStatus::Running
        })
        .await;

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyActive { .. }));
        sup.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn schedule_mode_runs_once_and_stops() {
        let fx = fixture();
        let sup = Supervisor::new(spec("tick", RunMode::Schedule, "exit 0"), fx.ctx);
        sup.start().await.unwrap();

        let state = wait_for(&sup, Duration::from_secs(5), |s| {
            s.status == WorkloadStatus::Stopped
        })
        .await;
        assert_eq!(state.run_count, 1);

        // A later firing starts it again.
        sup.start().await.unwrap();
        let state = wait_for(&sup, Duration::from_secs(5), |s| {
            s.status == WorkloadStatus::Stopped && s.run_count == 2
        })
        .await;
        assert_eq!(state.run_count, 2);
    }

    #[tokio::test]
    async fn spawn_failure_marks_failed_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(SupervisorContext {
            store: StateStoreHandle::discard(),
            worker_exe: dir.path().join("no-such-worker"),
            log_dir: None,
            shutdown: CancellationToken::new(),
        });
        let sup = Supervisor::new(spec("ghost", RunMode::Forever, "true"), ctx);
        sup.start().await.unwrap();

        let state = wait_for(&sup, Duration::from_secs(5), |s| {
            s.status == WorkloadStatus::Failed
        })
        .await;
        assert!(state
            .last_error
            .as_deref()
            .unwrap_or("")
            .starts_with("spawn failed"));
        assert_eq!(state.run_count, 0);
    }
}
