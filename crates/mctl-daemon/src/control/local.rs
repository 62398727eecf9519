//! Local control endpoint: one-shot JSON requests over a Unix socket.
//!
//! Each connection carries exactly one newline-terminated JSON request and
//! receives one JSON response. Access control is the filesystem permission
//! on the socket path. A malformed request gets an error reply; the server
//! keeps serving.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::{workload_detail, MAX_LOG_LINES};
use crate::orchestrator::Orchestrator;

#[derive(Debug, Deserialize)]
struct LocalRequest {
    command: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    lines: Option<usize>,
}

/// Binds the socket and serves until cancelled. The socket file is
/// unlinked before bind and again on exit.
pub async fn serve(
    socket_path: PathBuf,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    info!(socket = %socket_path.display(), "local control server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let orchestrator = Arc::clone(&orchestrator);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, orchestrator).await {
                                debug!(error = %e, "local control connection error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "local control accept failed"),
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    orchestrator: Arc<Orchestrator>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Ok(());
    }

    let response = match serde_json::from_str::<LocalRequest>(&line) {
        Ok(request) => dispatch(&orchestrator, request).await,
        Err(e) => error_response(format!("malformed request: {e}")),
    };

    let mut payload = serde_json::to_vec(&response)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await
}

async fn dispatch(orchestrator: &Arc<Orchestrator>, request: LocalRequest) -> Value {
    match request.command.as_str() {
        "list" => json!({
            "status": "ok",
            "workloads": orchestrator.list_infos(),
        }),
        "status" => match request.name.as_deref() {
            None => error_response("'status' requires a name".to_string()),
            Some(name) => match orchestrator.workload(name) {
                None => error_response(format!("Unknown workload: {name}")),
                Some((spec, state)) => {
                    let mut body = json!({ "status": "ok" });
                    body["workload"] = workload_detail(&spec, &state);
                    body["recent_runs"] =
                        serde_json::to_value(orchestrator.run_history(name, 5))
                            .unwrap_or(Value::Null);
                    body
                }
            },
        },
        "start" => match request.name.as_deref() {
            None => error_response("'start' requires a name".to_string()),
            Some(name) => command_response(orchestrator.start_workload(name).await),
        },
        "stop" => match request.name.as_deref() {
            None => error_response("'stop' requires a name".to_string()),
            Some(name) => command_response(orchestrator.stop_workload(name).await),
        },
        "restart" => match request.name.as_deref() {
            None => error_response("'restart' requires a name".to_string()),
            Some(name) => command_response(orchestrator.restart_workload(name).await),
        },
        "logs" => match request.name.as_deref() {
            None => error_response("'logs' requires a name".to_string()),
            Some(name) => {
                let lines = request.lines.unwrap_or(50).clamp(1, MAX_LOG_LINES);
                match orchestrator.read_logs(name, lines) {
                    None => error_response(format!("Unknown workload: {name}")),
                    Some(lines) => json!({ "status": "ok", "name": name, "lines": lines }),
                }
            }
        },
        "reload-configs" => match orchestrator.reload().await {
            Ok(report) => json!({ "status": "ok", "changes": report }),
            Err(e) => error_response(e.to_string()),
        },
        "shutdown" => {
            orchestrator.request_shutdown();
            json!({ "status": "ok", "message": "Shutting down" })
        }
        other => error_response(format!("Unknown command: {other}")),
    }
}

fn command_response(response: mctl_core::models::CommandResponse) -> Value {
    json!({
        "status": "ok",
        "success": response.success,
        "message": response.message,
    })
}

fn error_response(message: String) -> Value {
    json!({ "status": "error", "error": message })
}

/// Client helper for the one-shot protocol; used by tests and by anything
/// scripting the daemon locally.
pub async fn send_command(
    socket_path: &std::path::Path,
    request: &Value,
    timeout: Duration,
) -> std::io::Result<Value> {
    let run = async {
        let stream = UnixStream::connect(socket_path).await?;
        let (reader, mut writer) = stream.into_split();
        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
        writer.flush().await?;

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await?;
        serde_json::from_str(&line)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    };
    tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "request timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use mctl_core::config::DaemonConfig;
    use crate::orchestrator::OrchestratorConfig;
    use std::os::unix::fs::PermissionsExt;

    fn shell_worker(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("worker.sh");
        std::fs::write(&path, "#!/bin/sh\nexec sh -c \"$MCTL_MODULE\"\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn one_shot_protocol_round_trips() {
        let root = tempfile::tempdir().unwrap();
        let config_dir = root.path().join("configs");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("svc.yaml"),
            "name: svc\ntype: service\nrun_mode: forever\nmodule: sleep 30\n",
        )
        .unwrap();

        let socket_path = root.path().join("mctl.sock");
        let orch = Orchestrator::new(OrchestratorConfig {
            config_dir,
            db_path: root.path().join("state.db"),
            log_dir: None,
            socket_path: socket_path.clone(),
            worker_exe: shell_worker(root.path()),
            daemon: DaemonConfig::default(),
        })
        .unwrap();
        orch.start().await.unwrap();

        // The server task binds asynchronously.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !socket_path.exists() {
            assert!(tokio::time::Instant::now() < deadline, "socket never appeared");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let response = send_command(
            &socket_path,
            &json!({"command": "list"}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "ok");
        assert_eq!(response["workloads"][0]["name"], "svc");

        let response = send_command(
            &socket_path,
            &json!({"command": "status", "name": "missing"}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "error");

        let response = send_command(
            &socket_path,
            &json!({"command": "bogus"}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "error");
        assert!(response["error"]
            .as_str()
            .unwrap()
            .contains("Unknown command"));

        orch.shutdown().await;
        assert!(!socket_path.exists());
    }
}
