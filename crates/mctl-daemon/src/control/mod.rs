//! Local (Unix socket) and remote (HTTP) control surfaces.

pub mod http;
pub mod local;

use serde_json::{json, Value};

use mctl_core::models::{WorkloadSpec, WorkloadState};

/// Detailed status payload shared by the `status` command and the
/// `/api/status/{name}` endpoint.
pub fn workload_detail(spec: &WorkloadSpec, state: &WorkloadState) -> Value {
    json!({
        "name": spec.name,
        "type": spec.workload_type,
        "run_mode": spec.run_mode,
        "status": state.status,
        "pid": state.pid,
        "run_count": state.run_count,
        "consecutive_failures": state.consecutive_failures,
        "last_started": state.last_started,
        "last_stopped": state.last_stopped,
        "last_error": state.last_error,
        "schedule": spec.schedule,
        "max_runs": spec.max_runs,
        "module": spec.module,
        "entry_point": spec.entry_point,
        "version": spec.version,
        "tags": spec.tags,
    })
}

/// Clamp contract for log tail requests.
pub const MAX_LOG_LINES: usize = 10_000;
