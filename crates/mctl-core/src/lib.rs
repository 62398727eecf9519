//! Shared domain models and configuration for the Master Control fleet.
//!
//! This crate holds everything both halves of the system agree on: the
//! workload data model, the wire types exchanged between device daemons and
//! the central controller, the YAML configuration schema, and small helpers
//! (token comparison, millisecond timestamps) used by both stores.

pub mod auth;
pub mod config;
pub mod models;
pub mod time;

pub use config::{ConfigError, ConfigLoader, DaemonConfig};
pub use models::{
    ClientOverview, ClientStatus, CommandResponse, DeploymentClientRecord,
    DeploymentClientStatus, DeploymentRecord, DeploymentRequest, DeploymentStatus,
    HeartbeatPayload, ReloadReport, RunMode, RunRecord, SystemMetrics, WorkloadInfo,
    WorkloadSpec, WorkloadState, WorkloadStatus, WorkloadType,
};
