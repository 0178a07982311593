//! Channel poll loops.
//!
//! One task per configured channel. The cursor lives in the store and only
//! advances after every fetched item has been handed to the orchestrator, so
//! a failed poll or a crash mid-batch re-reads items instead of losing them;
//! ingestion dedup makes the re-read harmless.

use crate::orchestrator::{InboundEvent, Orchestrator};
use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_channels::ChannelAdapter;
use relay_store::Store;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollerStatus {
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub items_ingested: u64,
}

/// Shared liveness snapshot, written by poll loops and read by the admin
/// health endpoint.
pub type PollerBoard = Arc<DashMap<String, PollerStatus>>;

pub fn spawn_pollers(
    channels: &HashMap<String, Arc<dyn ChannelAdapter>>,
    intervals: &HashMap<String, Duration>,
    store: Store,
    orchestrator: Arc<Orchestrator>,
    board: PollerBoard,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(channels.len());
    for (channel_id, adapter) in channels {
        let interval = intervals
            .get(channel_id)
            .copied()
            .unwrap_or(Duration::from_secs(2));
        let channel_id = channel_id.clone();
        let adapter = adapter.clone();
        let store = store.clone();
        let orchestrator = orchestrator.clone();
        let board = board.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            poll_loop(channel_id, adapter, interval, store, orchestrator, board, shutdown).await;
        }));
    }
    handles
}

#[tracing::instrument(level = "info", skip_all, fields(channel = %channel_id))]
async fn poll_loop(
    channel_id: String,
    adapter: Arc<dyn ChannelAdapter>,
    interval: Duration,
    store: Store,
    orchestrator: Arc<Orchestrator>,
    board: PollerBoard,
    shutdown: CancellationToken,
) {
    let mut failed_attempts: u32 = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        match poll_channel_once(&channel_id, adapter.as_ref(), &store, &orchestrator).await {
            Ok(ingested) => {
                failed_attempts = 0;
                let mut status = board.entry(channel_id.clone()).or_default();
                status.last_success_at = Some(Utc::now());
                status.consecutive_failures = 0;
                status.items_ingested += ingested as u64;
            }
            Err(e) => {
                failed_attempts += 1;
                {
                    let mut status = board.entry(channel_id.clone()).or_default();
                    status.last_error_at = Some(Utc::now());
                    status.last_error = Some(e.to_string());
                    status.consecutive_failures = failed_attempts;
                }
                tracing::warn!(error = %e, failed_attempts, "channel poll failed");
                let backoff = Duration::from_millis((failed_attempts.min(20) as u64) * 250);
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

/// One poll cycle: fetch past the stored cursor, hand every item to the
/// orchestrator in channel order, then advance the cursor. Any failure
/// before the advance leaves the cursor untouched.
pub async fn poll_channel_once(
    channel_id: &str,
    adapter: &dyn ChannelAdapter,
    store: &Store,
    orchestrator: &Orchestrator,
) -> Result<usize> {
    let cursor = store.get_cursor(channel_id).await?;
    let batch = adapter.poll(cursor.as_deref()).await?;
    let fetched = batch.items.len();

    for item in batch.items {
        let event = InboundEvent {
            channel: channel_id.to_string(),
            external_id: item.external_id.into_inner(),
            sender: item.sender.into_inner(),
            title: item.title,
            body: item.body,
            target: item.target.map(|t| t.into_inner()),
            context: item.context,
        };
        orchestrator.handle_inbound(event).await?;
    }

    if let Some(next_cursor) = batch.next_cursor.as_deref() {
        store.set_cursor(channel_id, next_cursor).await?;
    }
    if fetched > 0 {
        tracing::debug!(channel = channel_id, fetched, "poll cycle complete");
    }
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::ApprovalPolicy;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use relay_channels::{ChannelBatch, ChannelItem};
    use relay_connector::{ExecutionConnector, ExecutionContext, ExecutionOutcome};
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    struct EchoConnector;

    #[async_trait]
    impl ExecutionConnector for EchoConnector {
        fn connector_id(&self) -> &str {
            "echo"
        }

        async fn run(
            &self,
            _ctx: &ExecutionContext,
            command_text: &str,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> relay_connector::Result<ExecutionOutcome> {
            Ok(ExecutionOutcome {
                success: true,
                output: format!("echo: {command_text}"),
                error: None,
            })
        }
    }

    /// Adapter driven by a queue of scripted poll results; records the
    /// cursor seen on every poll and all written replies.
    struct ScriptedAdapter {
        batches: Mutex<VecDeque<anyhow::Result<ChannelBatch>>>,
        seen_cursors: Mutex<Vec<Option<String>>>,
        writes: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedAdapter {
        fn new(batches: Vec<anyhow::Result<ChannelBatch>>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
                seen_cursors: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChannelAdapter for ScriptedAdapter {
        fn channel_id(&self) -> &str {
            "messages"
        }

        async fn poll(&self, since_cursor: Option<&str>) -> anyhow::Result<ChannelBatch> {
            self.seen_cursors
                .lock()
                .await
                .push(since_cursor.map(ToOwned::to_owned));
            self.batches
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(ChannelBatch::default()))
        }

        async fn write_result(&self, target_id: &str, text: &str) -> anyhow::Result<()> {
            self.writes
                .lock()
                .await
                .push((target_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn item(external_id: &str, body: &str) -> ChannelItem {
        ChannelItem {
            external_id: external_id.into(),
            sender: "alice".into(),
            title: None,
            body: body.to_string(),
            target: Some("thread-1".into()),
            context: serde_json::Value::Null,
        }
    }

    async fn harness(adapter: Arc<ScriptedAdapter>) -> (Store, Orchestrator) {
        let store = Store::open_in_memory().await.expect("open store");
        let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
        channels.insert("messages".to_string(), adapter);
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(EchoConnector),
            channels,
            "home".to_string(),
            vec!["home".to_string()],
            ApprovalPolicy {
                ttl: ChronoDuration::minutes(30),
                sweep_interval: Duration::from_secs(60),
            },
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        (store, orchestrator)
    }

    #[tokio::test]
    async fn items_flow_to_the_orchestrator_and_replies_are_delivered() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![Ok(ChannelBatch {
            items: vec![item("m-1", "hello"), item("m-2", "world")],
            next_cursor: Some("2".to_string()),
        })]));
        let (store, orchestrator) = harness(adapter.clone()).await;

        let ingested = poll_channel_once("messages", adapter.as_ref(), &store, &orchestrator)
            .await
            .expect("poll");
        assert_eq!(ingested, 2);
        assert_eq!(
            store.get_cursor("messages").await.expect("cursor").as_deref(),
            Some("2")
        );

        let writes = adapter.writes.lock().await;
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].0, "thread-1");
        assert_eq!(writes[0].1, "echo: hello");
    }

    #[tokio::test]
    async fn failed_poll_leaves_cursor_and_retry_produces_no_duplicates() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            Ok(ChannelBatch {
                items: vec![item("m-1", "first")],
                next_cursor: Some("1".to_string()),
            }),
            Err(anyhow::anyhow!("bridge unreachable")),
            // Recovery tick re-serves the already-seen item plus a new one.
            Ok(ChannelBatch {
                items: vec![item("m-1", "first"), item("m-2", "second")],
                next_cursor: Some("2".to_string()),
            }),
        ]));
        let (store, orchestrator) = harness(adapter.clone()).await;

        poll_channel_once("messages", adapter.as_ref(), &store, &orchestrator)
            .await
            .expect("tick 1");
        let err = poll_channel_once("messages", adapter.as_ref(), &store, &orchestrator)
            .await
            .expect_err("tick 2 must fail");
        assert!(err.to_string().contains("bridge unreachable"));
        assert_eq!(
            store.get_cursor("messages").await.expect("cursor").as_deref(),
            Some("1")
        );

        poll_channel_once("messages", adapter.as_ref(), &store, &orchestrator)
            .await
            .expect("tick 3");
        assert_eq!(
            store.get_cursor("messages").await.expect("cursor").as_deref(),
            Some("2")
        );

        // m-1 was re-served but deduplicated: two messages, two runs total.
        assert_eq!(store.list_inbound(10).await.expect("inbound").len(), 2);
        assert_eq!(store.list_runs(10).await.expect("runs").len(), 2);

        let cursors = adapter.seen_cursors.lock().await;
        assert_eq!(
            *cursors,
            vec![None, Some("1".to_string()), Some("1".to_string())]
        );
    }
}
