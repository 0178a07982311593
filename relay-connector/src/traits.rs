use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Session context handed to the backend alongside the command text.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    pub run_id: String,
    pub sender: String,
    pub workspace: String,
    pub channel: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

/// Calling contract for the external execution backend.
///
/// Implementations must honor the caller-supplied timeout and cancellation
/// token: a stuck backend is killed/abandoned, never awaited indefinitely.
#[async_trait]
pub trait ExecutionConnector: Send + Sync {
    fn connector_id(&self) -> &str;

    async fn run(
        &self,
        ctx: &ExecutionContext,
        command_text: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome>;

    /// Streaming variant: incremental progress lines are pushed through
    /// `progress` before the final outcome. Connectors without incremental
    /// output fall back to the blocking call.
    async fn run_streaming(
        &self,
        ctx: &ExecutionContext,
        command_text: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        _progress: mpsc::Sender<String>,
    ) -> Result<ExecutionOutcome> {
        self.run(ctx, command_text, timeout, cancel).await
    }
}
