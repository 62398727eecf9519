//! Liveness probing and system metrics sampling.
//!
//! A periodic sweep checks that every `running` workload's pid still names
//! a live process, warns when a workload's resident set approaches its
//! configured memory ceiling, and caches a system metrics snapshot for the
//! heartbeat reporter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use sysinfo::{Disks, Pid, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mctl_core::models::{SystemMetrics, WorkloadStatus};

use crate::registry::Registry;
use crate::supervisor::limits;

/// Default sweep cadence.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);
/// Fraction of `memory_limit_mb` at which a warning is emitted.
const MEMORY_WARN_RATIO: f64 = 0.90;
/// Minimum spacing between memory warnings per workload.
const MEMORY_WARN_EVERY: Duration = Duration::from_secs(60);

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Periodic health sweep over running workloads.
pub struct HealthMonitor {
    registry: Arc<Registry>,
    interval: Duration,
    snapshot: RwLock<SystemMetrics>,
    warned: Mutex<HashMap<String, Instant>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_interval(registry, DEFAULT_INTERVAL)
    }

    pub fn with_interval(registry: Arc<Registry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            snapshot: RwLock::new(SystemMetrics::default()),
            warned: Mutex::new(HashMap::new()),
        }
    }

    /// Most recent system metrics sample.
    pub fn metrics_snapshot(&self) -> SystemMetrics {
        self.snapshot.read().expect("metrics lock").clone()
    }

    /// Runs the sweep loop until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut sys = System::new();
        let mut disks = Disks::new_with_refreshed_list();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            self.sweep(&mut sys, &mut disks);
        }
        debug!("health monitor stopped");
    }

    fn sweep(&self, sys: &mut System, disks: &mut Disks) {
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        sys.refresh_processes();
        disks.refresh();

        {
            let mut snapshot = self.snapshot.write().expect("metrics lock");
            *snapshot = collect_metrics(sys, disks);
        }

        for supervisor in self.registry.snapshot() {
            let state = supervisor.state_snapshot();
            if state.status != WorkloadStatus::Running {
                continue;
            }
            let Some(pid) = state.pid else { continue };

            if !limits::process_alive(pid) {
                supervisor.mark_process_lost();
                continue;
            }

            let Some(limit_mb) = supervisor.spec().memory_limit_mb else {
                continue;
            };
            // RSS sampling can be unavailable; the warning silently skips.
            let Some(process) = sys.process(Pid::from_u32(pid)) else {
                continue;
            };
            let rss_mb = process.memory() as f64 / BYTES_PER_MB;
            if rss_mb >= limit_mb as f64 * MEMORY_WARN_RATIO {
                let mut warned = self.warned.lock().expect("warn lock");
                let due = warned
                    .get(supervisor.name())
                    .map_or(true, |last| last.elapsed() >= MEMORY_WARN_EVERY);
                if due {
                    warned.insert(supervisor.name().to_string(), Instant::now());
                    warn!(
                        workload = supervisor.name(),
                        rss_mb = rss_mb as u64,
                        limit_mb,
                        "workload approaching its memory limit"
                    );
                }
            }
        }
    }
}

fn collect_metrics(sys: &System, disks: &Disks) -> SystemMetrics {
    let (disk_used_gb, disk_total_gb) = disks
        .iter()
        .find(|disk| disk.mount_point() == std::path::Path::new("/"))
        .map(|disk| {
            let total = disk.total_space() as f64 / BYTES_PER_GB;
            let used = (disk.total_space() - disk.available_space()) as f64 / BYTES_PER_GB;
            (used, total)
        })
        .unwrap_or((0.0, 0.0));

    SystemMetrics {
        cpu_percent: sys.global_cpu_info().cpu_usage() as f64,
        memory_used_mb: sys.used_memory() as f64 / BYTES_PER_MB,
        memory_total_mb: sys.total_memory() as f64 / BYTES_PER_MB,
        disk_used_gb,
        disk_total_gb,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_report_nonzero_memory() {
        let mut sys = System::new();
        let disks = Disks::new_with_refreshed_list();
        sys.refresh_memory();
        let metrics = collect_metrics(&sys, &disks);
        assert!(metrics.memory_total_mb > 0.0);
        assert!(metrics.memory_used_mb <= metrics.memory_total_mb);
    }

    #[tokio::test]
    async fn sweep_populates_snapshot() {
        let registry = Arc::new(Registry::new());
        let monitor = HealthMonitor::with_interval(registry, Duration::from_millis(10));
        let mut sys = System::new();
        let mut disks = Disks::new_with_refreshed_list();
        monitor.sweep(&mut sys, &mut disks);
        assert!(monitor.metrics_snapshot().memory_total_mb > 0.0);
    }
}
