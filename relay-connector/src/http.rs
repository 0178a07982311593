use crate::error::{ConnectorError, Result};
use crate::traits::{ExecutionConnector, ExecutionContext, ExecutionOutcome};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Connector that POSTs the command to a backend service.
#[derive(Clone)]
pub struct HttpConnector {
    http: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireOutcome {
    success: bool,
    #[serde(default)]
    output: String,
    #[serde(default)]
    error: Option<String>,
}

impl HttpConnector {
    pub fn new(url: &str) -> Result<Self> {
        let url = url.trim().to_string();
        if url.is_empty() {
            return Err(ConnectorError::Protocol("connector url is required".to_string()));
        }
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            url,
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }
}

#[async_trait::async_trait]
impl ExecutionConnector for HttpConnector {
    fn connector_id(&self) -> &str {
        "http"
    }

    async fn run(
        &self,
        ctx: &ExecutionContext,
        command_text: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let payload = serde_json::json!({
            "context": ctx,
            "command": command_text,
        });
        let mut request = self.http.post(&self.url).timeout(timeout).json(&payload);
        if let Some(token) = self.auth_token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = tokio::select! {
            res = request.send() => res.map_err(|e| {
                if e.is_timeout() {
                    ConnectorError::Timeout(timeout.as_secs())
                } else {
                    ConnectorError::Http(e.to_string())
                }
            })?,
            _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
        };

        let status = response.status();
        let body = tokio::select! {
            res = response.text() => res?,
            _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
        };

        if let Ok(wire) = serde_json::from_str::<WireOutcome>(&body) {
            return Ok(ExecutionOutcome {
                success: wire.success,
                output: wire.output,
                error: wire.error,
            });
        }
        if !status.is_success() {
            return Err(ConnectorError::Http(format!(
                "backend returned status={status} body={body}"
            )));
        }
        Ok(ExecutionOutcome {
            success: true,
            output: body,
            error: None,
        })
    }
}
