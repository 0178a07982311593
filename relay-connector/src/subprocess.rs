use crate::error::{ConnectorError, Result};
use crate::traits::{ExecutionConnector, ExecutionContext, ExecutionOutcome};
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Connector that invokes the backend as an opaque subprocess.
///
/// Protocol: one JSON request on stdin, then stdin is closed. Every stdout
/// line before the last is a progress event; the last line is expected to be
/// a JSON outcome `{success, output, error}`. A backend that prints plain
/// text instead still works: the whole stdout becomes the output and the
/// exit status decides success.
#[derive(Clone)]
pub struct SubprocessConnector {
    program: String,
    args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireOutcome {
    success: bool,
    #[serde(default)]
    output: String,
    #[serde(default)]
    error: Option<String>,
}

impl SubprocessConnector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        command_text: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        progress: Option<&mpsc::Sender<String>>,
    ) -> Result<ExecutionOutcome> {
        let request = serde_json::json!({
            "context": ctx,
            "command": command_text,
        });

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ConnectorError::Io(format!("spawn {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.to_string().as_bytes())
                .await
                .map_err(|e| ConnectorError::Io(format!("write request: {e}")))?;
            stdin
                .write_all(b"\n")
                .await
                .map_err(|e| ConnectorError::Io(format!("write request: {e}")))?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectorError::Io("child stdout not captured".to_string()))?;

        let collect = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut collected: Vec<String> = Vec::new();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| ConnectorError::Io(format!("read output: {e}")))?
            {
                if let Some(progress) = progress {
                    // Receiver lag or closure must not fail the run.
                    let _ = progress.try_send(line.clone());
                }
                collected.push(line);
            }
            let status = child
                .wait()
                .await
                .map_err(|e| ConnectorError::Io(format!("wait on child: {e}")))?;
            Ok::<_, ConnectorError>((collected, status))
        };

        let (collected, status) = tokio::select! {
            res = collect => res?,
            _ = cancel.cancelled() => {
                tracing::warn!(connector = %self.program, "connector call cancelled; child killed on drop");
                return Err(ConnectorError::Cancelled);
            }
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(connector = %self.program, timeout_seconds = timeout.as_secs(), "connector timed out; child killed on drop");
                return Err(ConnectorError::Timeout(timeout.as_secs()));
            }
        };

        Ok(interpret_output(&collected, status.success()))
    }
}

#[async_trait::async_trait]
impl ExecutionConnector for SubprocessConnector {
    fn connector_id(&self) -> &str {
        "subprocess"
    }

    async fn run(
        &self,
        ctx: &ExecutionContext,
        command_text: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        self.execute(ctx, command_text, timeout, cancel, None).await
    }

    async fn run_streaming(
        &self,
        ctx: &ExecutionContext,
        command_text: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        progress: mpsc::Sender<String>,
    ) -> Result<ExecutionOutcome> {
        self.execute(ctx, command_text, timeout, cancel, Some(&progress))
            .await
    }
}

fn interpret_output(lines: &[String], exit_ok: bool) -> ExecutionOutcome {
    if let Some(last) = lines.iter().rev().find(|l| !l.trim().is_empty()) {
        if let Ok(wire) = serde_json::from_str::<WireOutcome>(last) {
            return ExecutionOutcome {
                success: wire.success,
                output: wire.output,
                error: wire.error,
            };
        }
    }
    let output = lines.join("\n");
    ExecutionOutcome {
        success: exit_ok,
        output,
        error: if exit_ok {
            None
        } else {
            Some("backend exited with failure status".to_string())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpret_output_prefers_trailing_json_outcome() {
        let lines = vec![
            "working on it".to_string(),
            r#"{"success": true, "output": "done"}"#.to_string(),
        ];
        let outcome = interpret_output(&lines, true);
        assert!(outcome.success);
        assert_eq!(outcome.output, "done");
        assert!(outcome.error.is_none());
    }

    #[test]
    fn interpret_output_falls_back_to_plain_text_and_exit_status() {
        let lines = vec!["plain result".to_string()];
        let ok = interpret_output(&lines, true);
        assert!(ok.success);
        assert_eq!(ok.output, "plain result");

        let failed = interpret_output(&lines, false);
        assert!(!failed.success);
        assert!(failed.error.is_some());
    }

    #[tokio::test]
    async fn subprocess_roundtrip_with_streaming_progress() {
        let connector = SubprocessConnector::new(
            "/bin/sh",
            vec![
                "-c".to_string(),
                r#"cat > /dev/null; echo "step 1"; echo '{"success": true, "output": "finished"}'"#
                    .to_string(),
            ],
        );
        let ctx = ExecutionContext {
            run_id: "r-1".to_string(),
            sender: "alice".to_string(),
            workspace: "home".to_string(),
            channel: Some("messages".to_string()),
        };
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let outcome = connector
            .run_streaming(&ctx, "do the thing", Duration::from_secs(10), &cancel, tx)
            .await
            .expect("run_streaming");
        assert!(outcome.success);
        assert_eq!(outcome.output, "finished");
        assert_eq!(rx.recv().await.as_deref(), Some("step 1"));
    }

    #[tokio::test]
    async fn subprocess_timeout_kills_stuck_backend() {
        let connector = SubprocessConnector::new(
            "/bin/sh",
            vec!["-c".to_string(), "sleep 30".to_string()],
        );
        let ctx = ExecutionContext {
            run_id: "r-2".to_string(),
            sender: "alice".to_string(),
            workspace: "home".to_string(),
            channel: None,
        };
        let cancel = CancellationToken::new();
        let err = connector
            .run(&ctx, "hang", Duration::from_millis(100), &cancel)
            .await
            .expect_err("must time out");
        assert!(matches!(err, ConnectorError::Timeout(_)));
    }

    #[tokio::test]
    async fn subprocess_cancellation_wins_over_slow_backend() {
        let connector = SubprocessConnector::new(
            "/bin/sh",
            vec!["-c".to_string(), "sleep 30".to_string()],
        );
        let ctx = ExecutionContext {
            run_id: "r-3".to_string(),
            sender: "alice".to_string(),
            workspace: "home".to_string(),
            channel: None,
        };
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });
        let err = connector
            .run(&ctx, "hang", Duration::from_secs(30), &cancel)
            .await
            .expect_err("must be cancelled");
        assert!(matches!(err, ConnectorError::Cancelled));
    }
}
