//! Approval lifecycle policy and the expiry sweeper.
//!
//! The state machine itself is enforced by the store's guarded
//! compare-and-swap transition; this module owns the TTL policy and the
//! background task that retires pending requests past their deadline.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use relay_store::{RunState, Store};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct ApprovalPolicy {
    pub ttl: ChronoDuration,
    pub sweep_interval: Duration,
}

impl ApprovalPolicy {
    pub fn new(ttl_minutes: u64, sweep_interval_seconds: u64) -> Self {
        Self {
            ttl: ChronoDuration::minutes(ttl_minutes as i64),
            sweep_interval: Duration::from_secs(sweep_interval_seconds),
        }
    }

    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.ttl
    }
}

/// One sweep pass: every pending request past its deadline becomes
/// `expired`, its run follows, and each transition is audited.
pub async fn sweep_once(store: &Store) -> Result<usize> {
    let expired = store.expire_due(Utc::now()).await?;
    for (approval_id, run_id) in &expired {
        store
            .set_run_state(*run_id, RunState::Expired, None, Some("approval expired"))
            .await?;
        store
            .append_audit(
                Some(*run_id),
                "sweeper",
                "approval_expired",
                serde_json::json!({ "approval_id": approval_id }),
            )
            .await?;
    }
    Ok(expired.len())
}

pub fn spawn_sweeper(
    store: Store,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match sweep_once(&store).await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "expired pending approvals"),
                Err(e) => tracing::warn!(error = %e, "approval sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::ApprovalStatus;

    #[tokio::test]
    async fn sweep_expires_request_and_run_with_audit() {
        let store = Store::open_in_memory().await.expect("open store");
        let session = store
            .upsert_session("alice", "home", None, None)
            .await
            .expect("session");
        let run = store
            .create_run(session.id, "task", "deploy")
            .await
            .expect("run");
        store
            .set_run_state(run.id, RunState::AwaitingApproval, None, None)
            .await
            .expect("awaiting");
        store
            .create_approval(
                run.id,
                "alice",
                "task: deploy",
                Utc::now() - ChronoDuration::seconds(5),
            )
            .await
            .expect("approval");

        let count = sweep_once(&store).await.expect("sweep");
        assert_eq!(count, 1);

        let run = store.get_run(run.id).await.expect("get").expect("some");
        assert_eq!(run.state, RunState::Expired);
        let expired = store
            .list_approvals(Some(ApprovalStatus::Expired), 10)
            .await
            .expect("list");
        assert_eq!(expired.len(), 1);

        let tail = store.audit_tail(10).await.expect("tail");
        assert!(tail.iter().any(|e| e.event == "approval_expired"));

        // A second pass finds nothing new.
        assert_eq!(sweep_once(&store).await.expect("sweep"), 0);
    }
}
