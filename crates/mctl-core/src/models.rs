//! Workload and fleet domain models.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work a spec declares.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadType {
    Agent,
    Script,
    Service,
}

impl WorkloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Script => "script",
            Self::Service => "service",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "agent" => Some(Self::Agent),
            "script" => Some(Self::Script),
            "service" => Some(Self::Service),
            _ => None,
        }
    }
}

/// Restart policy applied when a workload's child process exits.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Schedule,
    Forever,
    NTimes,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Forever => "forever",
            Self::NTimes => "n_times",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "schedule" => Some(Self::Schedule),
            "forever" => Some(Self::Forever),
            "n_times" => Some(Self::NTimes),
            _ => None,
        }
    }
}

/// Lifecycle status of a supervised workload.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Completed,
}

impl WorkloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "registered" => Some(Self::Registered),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "failed" => Some(Self::Failed),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Statuses from which a new run may be started.
    pub fn is_startable(&self) -> bool {
        matches!(
            self,
            Self::Registered | Self::Stopped | Self::Failed | Self::Completed
        )
    }
}

/// Immutable declaration of a workload, loaded from YAML configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WorkloadSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub workload_type: WorkloadType,
    pub run_mode: RunMode,
    pub module: String,
    pub entry_point: String,
    pub params: BTreeMap<String, serde_json::Value>,
    pub version: Option<String>,
    pub schedule: Option<String>,
    pub max_runs: Option<u32>,
    pub restart_delay_s: f64,
    pub timeout_s: Option<f64>,
    pub memory_limit_mb: Option<u64>,
    pub cpu_nice: Option<i32>,
    pub tags: BTreeSet<String>,
}

/// Mutable runtime companion of a [`WorkloadSpec`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkloadState {
    pub status: WorkloadStatus,
    pub pid: Option<u32>,
    pub run_count: u32,
    pub consecutive_failures: u32,
    pub last_started: Option<DateTime<Utc>>,
    pub last_stopped: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for WorkloadState {
    fn default() -> Self {
        Self {
            status: WorkloadStatus::Registered,
            pid: None,
            run_count: 0,
            consecutive_failures: 0,
            last_started: None,
            last_stopped: None,
            last_heartbeat: None,
            last_error: None,
        }
    }
}

/// Append-only history entry for one completed (or aborted) run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRecord {
    pub workload_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
}

/// Workload state as reported over the wire (heartbeats, device API).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub workload_type: WorkloadType,
    pub run_mode: RunMode,
    pub status: WorkloadStatus,
    pub pid: Option<u32>,
    pub run_count: u32,
    pub last_started: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// System-level resource metrics sampled on a device.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub disk_used_gb: f64,
    pub disk_total_gb: f64,
}

/// Payload POSTed by device daemons to the central controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub client_name: String,
    pub timestamp: DateTime<Utc>,
    pub deployed_version: Option<String>,
    #[serde(default)]
    pub workloads: Vec<WorkloadInfo>,
    #[serde(default)]
    pub system: SystemMetrics,
}

/// Controller-assigned availability of a fleet client.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Online,
    Stale,
    Offline,
    Unknown,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Stale => "stale",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "online" => Self::Online,
            "stale" => Self::Stale,
            "offline" => Self::Offline,
            _ => Self::Unknown,
        }
    }
}

/// Summary of a client as seen by the central API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientOverview {
    pub name: String,
    pub host: String,
    pub api_port: u16,
    pub status: ClientStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub workload_count: u32,
    pub workloads_running: u32,
    pub workloads_failed: u32,
    pub deployed_version: Option<String>,
    pub system: Option<SystemMetrics>,
}

/// Generic result of a start/stop/restart command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
}

/// Diff produced by a configuration hot-reload.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReloadReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub restarted: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Overall status of a rolling deployment.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "rolling_back" => Some(Self::RollingBack),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }
}

/// Per-client status within a deployment.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentClientStatus {
    Pending,
    Deploying,
    Deployed,
    Healthy,
    Failed,
    RolledBack,
}

impl DeploymentClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deploying => "deploying",
            Self::Deployed => "deployed",
            Self::Healthy => "healthy",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "deploying" => Some(Self::Deploying),
            "deployed" => Some(Self::Deployed),
            "healthy" => Some(Self::Healthy),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }
}

/// Request to start a rolling deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub version: String,
    #[serde(default)]
    pub target_clients: Option<Vec<String>>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_health_check_timeout_s")]
    pub health_check_timeout_s: f64,
    #[serde(default = "default_auto_rollback")]
    pub auto_rollback: bool,
}

fn default_batch_size() -> usize {
    1
}

fn default_health_check_timeout_s() -> f64 {
    60.0
}

fn default_auto_rollback() -> bool {
    true
}

/// One client's progress through a deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentClientRecord {
    pub client_name: String,
    pub batch_number: u32,
    pub status: DeploymentClientStatus,
    pub previous_version: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A rolling deployment with its per-client records.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub version: String,
    pub status: DeploymentStatus,
    pub batch_size: usize,
    pub target_clients: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub clients: Vec<DeploymentClientRecord>,
}
