//! Heartbeat reporter: periodic status POSTs to the central controller.
//!
//! Heartbeats are stateless snapshots. A failed POST is logged at warn and
//! the interval backs off exponentially up to five minutes; nothing is
//! queued and the daemon never crashes over an unreachable controller.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mctl_core::config::FleetConfig;

use crate::orchestrator::Orchestrator;

const MAX_BACKOFF: Duration = Duration::from_secs(300);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HeartbeatReporter {
    orchestrator: Arc<Orchestrator>,
    config: FleetConfig,
    client: reqwest::Client,
}

impl HeartbeatReporter {
    pub fn new(orchestrator: Arc<Orchestrator>, config: FleetConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            orchestrator,
            config,
            client,
        }
    }

    /// Sends heartbeats until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let Some(url) = self.endpoint() else {
            return;
        };
        let interval = Duration::from_secs_f64(self.config.heartbeat_interval_s.max(1.0));
        info!(%url, interval_s = interval.as_secs_f64(), "heartbeat reporter started");

        let mut delay = interval;
        loop {
            match self.send(&url).await {
                Ok(()) => {
                    debug!("heartbeat sent");
                    delay = interval;
                }
                Err(e) => {
                    warn!(error = %e, "heartbeat failed");
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("heartbeat reporter stopped");
    }

    fn endpoint(&self) -> Option<String> {
        let base = self.config.central_api_url.as_deref()?;
        Some(format!("{}/api/heartbeat", base.trim_end_matches('/')))
    }

    async fn send(&self, url: &str) -> Result<(), reqwest::Error> {
        let payload = self.orchestrator.heartbeat_payload();
        let mut request = self.client.post(url).json(&payload);
        if let Some(token) = self.config.api_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        response.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter_with_url(url: Option<&str>) -> HeartbeatReporter {
        let root = tempfile::tempdir().unwrap();
        let config_dir = root.path().join("configs");
        std::fs::create_dir_all(&config_dir).unwrap();
        let orch = Orchestrator::new(crate::orchestrator::OrchestratorConfig {
            config_dir,
            db_path: root.path().join("state.db"),
            log_dir: None,
            socket_path: root.path().join("mctl.sock"),
            worker_exe: root.path().join("worker"),
            daemon: mctl_core::config::DaemonConfig::default(),
        })
        .unwrap();
        std::mem::forget(root);
        let config = FleetConfig {
            enabled: true,
            client_name: Some("edge-01".to_string()),
            central_api_url: url.map(str::to_string),
            ..FleetConfig::default()
        };
        HeartbeatReporter::new(orch, config)
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        let reporter = reporter_with_url(Some("http://controller:8080/"));
        assert_eq!(
            reporter.endpoint().as_deref(),
            Some("http://controller:8080/api/heartbeat")
        );
        assert_eq!(reporter_with_url(None).endpoint(), None);
    }

    #[tokio::test]
    async fn run_exits_immediately_without_url() {
        let reporter = reporter_with_url(None);
        let token = CancellationToken::new();
        // Must return without the token ever being cancelled.
        tokio::time::timeout(Duration::from_secs(1), reporter.run(token))
            .await
            .expect("run should return when no central url is configured");
    }
}
