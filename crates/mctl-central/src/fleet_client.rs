//! Thin HTTP adapter for the device API, used by the proxy routes and the
//! deployer. No retries at this layer; callers decide what a failure
//! means.

use std::time::Duration;

use serde_json::Value;

use mctl_core::models::CommandResponse;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LOGS_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum FleetClientError {
    #[error("device request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("device returned {status}: {detail}")]
    Status { status: u16, detail: String },
}

/// HTTP client for a single device daemon's API.
pub struct FleetClient {
    client: reqwest::Client,
    api_token: Option<String>,
}

impl FleetClient {
    pub fn new(api_token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { client, api_token }
    }

    fn base(&self, host: &str, port: u16) -> String {
        format!("http://{host}:{port}")
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_token.as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn request_json(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<Value, FleetClientError> {
        let response = self.apply_auth(builder).send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| {
                    body.get("detail")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| status.to_string());
            return Err(FleetClientError::Status {
                status: status.as_u16(),
                detail,
            });
        }
        Ok(response.json().await?)
    }

    pub async fn health(&self, host: &str, port: u16) -> Result<bool, FleetClientError> {
        let url = format!("{}/api/health", self.base(host, port));
        let body = self.request_json(self.client.get(url)).await?;
        Ok(body.get("status").and_then(Value::as_str) == Some("ok"))
    }

    pub async fn list_workloads(&self, host: &str, port: u16) -> Result<Value, FleetClientError> {
        let url = format!("{}/api/list", self.base(host, port));
        self.request_json(self.client.get(url)).await
    }

    pub async fn workload_status(
        &self,
        host: &str,
        port: u16,
        name: &str,
    ) -> Result<Value, FleetClientError> {
        let url = format!("{}/api/status/{name}", self.base(host, port));
        self.request_json(self.client.get(url)).await
    }

    pub async fn start_workload(
        &self,
        host: &str,
        port: u16,
        name: &str,
    ) -> Result<CommandResponse, FleetClientError> {
        let url = format!("{}/api/start/{name}", self.base(host, port));
        let body = self.request_json(self.client.post(url)).await?;
        Ok(parse_command_response(body))
    }

    pub async fn stop_workload(
        &self,
        host: &str,
        port: u16,
        name: &str,
    ) -> Result<CommandResponse, FleetClientError> {
        let url = format!("{}/api/stop/{name}", self.base(host, port));
        let body = self.request_json(self.client.post(url)).await?;
        Ok(parse_command_response(body))
    }

    pub async fn restart_workload(
        &self,
        host: &str,
        port: u16,
        name: &str,
    ) -> Result<CommandResponse, FleetClientError> {
        let url = format!("{}/api/restart/{name}", self.base(host, port));
        let body = self.request_json(self.client.post(url)).await?;
        Ok(parse_command_response(body))
    }

    pub async fn reload(&self, host: &str, port: u16) -> Result<Value, FleetClientError> {
        let url = format!("{}/api/reload", self.base(host, port));
        self.request_json(self.client.post(url)).await
    }

    /// Log fetches stream more data than the other calls and get a longer
    /// per-request timeout.
    pub async fn logs(
        &self,
        host: &str,
        port: u16,
        name: &str,
        lines: usize,
    ) -> Result<Value, FleetClientError> {
        let url = format!("{}/api/logs/{name}", self.base(host, port));
        self.request_json(
            self.client
                .get(url)
                .query(&[("lines", lines)])
                .timeout(LOGS_TIMEOUT),
        )
        .await
    }
}

fn parse_command_response(body: Value) -> CommandResponse {
    CommandResponse {
        success: body
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        message: body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    async fn fake_device() -> u16 {
        let app = Router::new()
            .route("/api/health", get(|| async { Json(json!({"status": "ok"})) }))
            .route(
                "/api/start/:name",
                post(|axum::extract::Path(name): axum::extract::Path<String>| async move {
                    Json(json!({"success": true, "message": format!("Started '{name}'")}))
                }),
            )
            .route(
                "/api/status/:name",
                get(|| async {
                    (
                        axum::http::StatusCode::NOT_FOUND,
                        Json(json!({"detail": "Unknown workload: ghost"})),
                    )
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn health_and_commands_round_trip() {
        let port = fake_device().await;
        let client = FleetClient::new(None);

        assert!(client.health("127.0.0.1", port).await.unwrap());

        let response = client
            .start_workload("127.0.0.1", port, "svc")
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.message, "Started 'svc'");
    }

    #[tokio::test]
    async fn error_bodies_surface_the_detail() {
        let port = fake_device().await;
        let client = FleetClient::new(None);

        let err = client
            .workload_status("127.0.0.1", port, "ghost")
            .await
            .unwrap_err();
        match err {
            FleetClientError::Status { status, detail } => {
                assert_eq!(status, 404);
                assert_eq!(detail, "Unknown workload: ghost");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unreachable_device_is_an_http_error() {
        let client = FleetClient::new(None);
        // Port 1 is virtually never listening.
        let err = client.health("127.0.0.1", 1).await.unwrap_err();
        assert!(matches!(err, FleetClientError::Http(_)));
    }
}
