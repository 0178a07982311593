//! Routing and approval core.
//!
//! Consumes normalized inbound events from every channel, classifies each
//! command, drives run and approval lifecycles against the store, and calls
//! the execution connector for anything allowed to run.

use crate::approvals::ApprovalPolicy;
use crate::parser::{self, CommandKind, ParsedCommand};
use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use relay_channels::ChannelAdapter;
use relay_connector::{ExecutionConnector, ExecutionContext};
use relay_store::{
    ApprovalTransition, IngestOutcome, NewInboundMessage, Run, RunState, Session, Store,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One normalized inbound event, produced by a channel poller or the
/// programmatic command endpoint.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub channel: String,
    pub external_id: String,
    pub sender: String,
    pub title: Option<String>,
    pub body: String,
    pub target: Option<String>,
    pub context: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub run_id: Option<Uuid>,
    pub text: String,
}

pub struct Orchestrator {
    store: Store,
    connector: Arc<dyn ExecutionConnector>,
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    default_workspace: String,
    known_workspaces: Vec<String>,
    approval_policy: ApprovalPolicy,
    connector_timeout: Duration,
    in_flight: DashMap<Uuid, CancellationToken>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        connector: Arc<dyn ExecutionConnector>,
        channels: HashMap<String, Arc<dyn ChannelAdapter>>,
        default_workspace: String,
        known_workspaces: Vec<String>,
        approval_policy: ApprovalPolicy,
        connector_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            connector,
            channels,
            default_workspace,
            known_workspaces,
            approval_policy,
            connector_timeout,
            in_flight: DashMap::new(),
            shutdown,
        }
    }

    /// Full ingestion path for one inbound event. Returns `None` when the
    /// event's external id has already been processed.
    #[tracing::instrument(level = "info", skip_all, fields(channel = %event.channel, sender = %event.sender))]
    pub async fn handle_inbound(&self, event: InboundEvent) -> Result<Option<Reply>> {
        let ingest = self
            .store
            .record_inbound(&NewInboundMessage {
                channel: event.channel.clone(),
                external_id: event.external_id.clone(),
                sender: event.sender.clone(),
                title: event.title.clone(),
                body: event.body.clone(),
                context: event.context.clone(),
            })
            .await?;
        if ingest == IngestOutcome::Duplicate {
            tracing::debug!(external_id = %event.external_id, "duplicate inbound item skipped");
            return Ok(None);
        }

        let parsed = parser::parse(event.title.as_deref(), &event.body);
        let reply = self.route(&event, parsed).await?;
        self.deliver(&event, &reply).await;
        Ok(Some(reply))
    }

    async fn deliver(&self, event: &InboundEvent, reply: &Reply) {
        let Some(adapter) = self.channels.get(&event.channel) else {
            return;
        };
        let target = event.target.as_deref().unwrap_or(&event.sender);
        if let Err(e) = adapter.write_result(target, &reply.text).await {
            tracing::warn!(channel = %event.channel, reply_target = target, error = %e, "reply delivery failed");
            let _ = self
                .store
                .append_audit(
                    reply.run_id,
                    "egress",
                    "reply_delivery_failed",
                    serde_json::json!({ "channel": event.channel, "error": e.to_string() }),
                )
                .await;
        }
    }

    async fn route(&self, event: &InboundEvent, parsed: ParsedCommand) -> Result<Reply> {
        let (workspace, alias_note) = self.resolve_workspace(parsed.workspace.as_deref());
        let session = self
            .store
            .upsert_session(
                &event.sender,
                &workspace,
                Some(&event.channel),
                event.target.as_deref(),
            )
            .await?;

        let payload = match parsed.kind {
            CommandKind::Approve | CommandKind::Deny => {
                parsed.target.clone().unwrap_or_default()
            }
            _ => parsed.payload.clone(),
        };
        let run = self
            .store
            .create_run(session.id, parsed.kind.as_str(), &payload)
            .await?;
        self.store
            .append_audit(
                Some(run.id),
                "orchestrator",
                "run_created",
                serde_json::json!({
                    "kind": parsed.kind.as_str(),
                    "channel": event.channel,
                    "sender": event.sender,
                }),
            )
            .await?;

        let mut reply = match parsed.kind {
            CommandKind::Chat => self.run_chat(&session, &run, event).await?,
            CommandKind::Task | CommandKind::Project => {
                self.gate_for_approval(&session, &run, &parsed).await?
            }
            CommandKind::Approve => {
                self.run_approval_control(&session, &run, &parsed, true, event)
                    .await?
            }
            CommandKind::Deny => {
                self.run_approval_control(&session, &run, &parsed, false, event)
                    .await?
            }
            CommandKind::Status => self.run_status(&session, &run).await?,
            CommandKind::History => self.run_history(&session, &run).await?,
            CommandKind::Health => self.run_health(&run).await?,
            CommandKind::SystemControl => self.run_system_control(&session, &run, &parsed).await?,
        };

        if let Some(note) = alias_note {
            reply.text = format!("{note}\n{}", reply.text);
        }
        Ok(reply)
    }

    /// Unknown aliases fall back to the default workspace; the fallback is
    /// reported to the sender rather than silently applied.
    fn resolve_workspace(&self, alias: Option<&str>) -> (String, Option<String>) {
        let Some(alias) = alias else {
            return (self.default_workspace.clone(), None);
        };
        if let Some(known) = self
            .known_workspaces
            .iter()
            .find(|w| w.eq_ignore_ascii_case(alias))
        {
            return (known.clone(), None);
        }
        (
            self.default_workspace.clone(),
            Some(format!(
                "Unknown workspace @{alias}; using {}.",
                self.default_workspace
            )),
        )
    }

    // ---- non-mutating kinds ----

    async fn run_chat(&self, session: &Session, run: &Run, event: &InboundEvent) -> Result<Reply> {
        let text = self
            .execute_via_connector(session, run, Some(event.channel.as_str()))
            .await?;
        Ok(Reply {
            run_id: Some(run.id),
            text,
        })
    }

    async fn run_status(&self, session: &Session, run: &Run) -> Result<Reply> {
        self.transition(run.id, RunState::Running, None, None).await?;
        let pending = self
            .store
            .list_approvals(Some(relay_store::ApprovalStatus::Pending), 50)
            .await?
            .into_iter()
            .filter(|a| a.requester == session.sender)
            .count();
        let recent = self.store.list_runs_for_session(session.id, 5).await?;
        let text = format!(
            "workspace={} mode={} pending_approvals={} recent_runs={}",
            session.workspace,
            session.mode,
            pending,
            recent
                .iter()
                .map(|r| format!("{}:{}", r.kind, r.state))
                .collect::<Vec<_>>()
                .join(",")
        );
        self.transition(run.id, RunState::Completed, Some(&text), None)
            .await?;
        Ok(Reply {
            run_id: Some(run.id),
            text,
        })
    }

    async fn run_history(&self, session: &Session, run: &Run) -> Result<Reply> {
        self.transition(run.id, RunState::Running, None, None).await?;
        let runs = self.store.list_runs_for_session(session.id, 10).await?;
        let mut lines = Vec::with_capacity(runs.len());
        for r in &runs {
            if r.id == run.id {
                continue;
            }
            lines.push(format!(
                "{} {} {} {}",
                r.created_at.format("%Y-%m-%d %H:%M"),
                r.kind,
                r.state,
                truncate(&r.payload, 60)
            ));
        }
        let text = if lines.is_empty() {
            "No prior runs in this session.".to_string()
        } else {
            lines.join("\n")
        };
        self.transition(run.id, RunState::Completed, Some(&text), None)
            .await?;
        Ok(Reply {
            run_id: Some(run.id),
            text,
        })
    }

    async fn run_health(&self, run: &Run) -> Result<Reply> {
        self.transition(run.id, RunState::Running, None, None).await?;
        let started_at = self
            .store
            .get_meta("started_at")
            .await?
            .unwrap_or_else(|| "unknown".to_string());
        let metrics = self.store.metrics().await?;
        let text = format!(
            "ok started_at={} sessions={} runs={} approvals={}",
            started_at,
            metrics.sessions,
            metrics.runs_by_state.iter().map(|(_, n)| n).sum::<i64>(),
            metrics
                .approvals_by_status
                .iter()
                .map(|(_, n)| n)
                .sum::<i64>(),
        );
        self.transition(run.id, RunState::Completed, Some(&text), None)
            .await?;
        Ok(Reply {
            run_id: Some(run.id),
            text,
        })
    }

    async fn run_system_control(
        &self,
        session: &Session,
        run: &Run,
        parsed: &ParsedCommand,
    ) -> Result<Reply> {
        self.transition(run.id, RunState::Running, None, None).await?;
        let mut words = parsed.payload.split_whitespace();
        let directive = words.next().unwrap_or_default().to_ascii_lowercase();
        let argument = words.collect::<Vec<_>>().join(" ");

        let text = match directive.as_str() {
            "ping" => "pong".to_string(),
            "mode" if !argument.is_empty() => {
                self.store.set_session_mode(session.id, &argument).await?;
                format!("mode={argument}")
            }
            "cancel" => match argument.parse::<Uuid>() {
                Ok(target) => {
                    if let Some(entry) = self.in_flight.get(&target) {
                        entry.value().cancel();
                        format!("cancel requested for run {target}")
                    } else {
                        format!("run {target} is not executing")
                    }
                }
                Err(_) => "Usage: system: cancel <run-id>".to_string(),
            },
            _ => "Supported: system: ping | mode <label> | cancel <run-id>".to_string(),
        };
        self.transition(run.id, RunState::Completed, Some(&text), None)
            .await?;
        Ok(Reply {
            run_id: Some(run.id),
            text,
        })
    }

    // ---- mutating kinds ----

    async fn gate_for_approval(
        &self,
        session: &Session,
        run: &Run,
        parsed: &ParsedCommand,
    ) -> Result<Reply> {
        let expires_at = self.approval_policy.expires_at(Utc::now());
        let summary = match parsed.due.as_deref() {
            Some(due) => format!("{}: {} (due {due})", parsed.kind, parsed.payload),
            None => format!("{}: {}", parsed.kind, parsed.payload),
        };

        self.transition(run.id, RunState::AwaitingApproval, None, None)
            .await?;
        let approval = self
            .store
            .create_approval(run.id, &session.sender, &summary, expires_at)
            .await?;
        self.store
            .append_audit(
                Some(run.id),
                "approval",
                "approval_requested",
                serde_json::json!({
                    "approval_id": approval.id,
                    "expires_at": expires_at,
                }),
            )
            .await?;

        let mut text = format!(
            "Approval required for {summary}.\nReply 'approve {}' or 'deny {}' before {}.",
            approval.id,
            approval.id,
            expires_at.format("%Y-%m-%d %H:%M UTC"),
        );
        if parsed.kind == CommandKind::Task && parsed.due.is_none() {
            text.push_str("\nNo due date provided; the task will be triaged best-effort.");
        }
        Ok(Reply {
            run_id: Some(run.id),
            text,
        })
    }

    /// Shared approve/deny path for sender commands and the admin override.
    /// `actor` is `None` for the override, which skips the requester guard
    /// but still requires the request to be pending and unexpired.
    pub async fn resolve_approval_decision(
        &self,
        actor: Option<&str>,
        approval_id: Uuid,
        approve: bool,
    ) -> Result<Reply> {
        let transition = self
            .store
            .resolve_approval(approval_id, actor, approve, Utc::now())
            .await?;

        match transition {
            ApprovalTransition::Applied => {
                let approval = self
                    .store
                    .get_approval(approval_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("approval vanished after transition"))?;
                let verdict = if approve { "approved" } else { "denied" };
                self.store
                    .append_audit(
                        Some(approval.run_id),
                        "approval",
                        &format!("approval_{verdict}"),
                        serde_json::json!({
                            "approval_id": approval_id,
                            "actor": actor,
                        }),
                    )
                    .await?;

                if !approve {
                    self.transition(approval.run_id, RunState::Denied, None, None)
                        .await?;
                    return Ok(Reply {
                        run_id: Some(approval.run_id),
                        text: format!("Denied {}. No changes were made.", approval.summary),
                    });
                }

                let Some(target_run) = self.store.get_run(approval.run_id).await? else {
                    return Err(anyhow::anyhow!("run vanished for approval {approval_id}"));
                };
                let Some(target_session) = self.store.get_session(target_run.session_id).await?
                else {
                    return Err(anyhow::anyhow!("session vanished for run {}", target_run.id));
                };
                let channel = target_session.last_channel.clone();
                let text = self
                    .execute_via_connector(&target_session, &target_run, channel.as_deref())
                    .await?;
                Ok(Reply {
                    run_id: Some(target_run.id),
                    text: format!("Approved {}.\n{text}", approval.summary),
                })
            }
            ApprovalTransition::WrongSender => {
                if let Some(approval) = self.store.get_approval(approval_id).await? {
                    self.store
                        .append_audit(
                            Some(approval.run_id),
                            "approval",
                            "approval_conflict",
                            serde_json::json!({
                                "approval_id": approval_id,
                                "actor": actor,
                                "reason": "wrong_sender",
                            }),
                        )
                        .await?;
                }
                Ok(Reply {
                    run_id: None,
                    text: "Only the original requester may act on this approval.".to_string(),
                })
            }
            ApprovalTransition::NotPending(status) => {
                if let Some(approval) = self.store.get_approval(approval_id).await? {
                    self.store
                        .append_audit(
                            Some(approval.run_id),
                            "approval",
                            "approval_conflict",
                            serde_json::json!({
                                "approval_id": approval_id,
                                "actor": actor,
                                "reason": "not_pending",
                                "status": status,
                            }),
                        )
                        .await?;
                }
                Ok(Reply {
                    run_id: None,
                    text: format!("Approval {approval_id} is already {status}; no action taken."),
                })
            }
            ApprovalTransition::AlreadyExpired => {
                if let Some(approval) = self.store.get_approval(approval_id).await? {
                    self.transition(approval.run_id, RunState::Expired, None, Some("approval expired"))
                        .await?;
                    self.store
                        .append_audit(
                            Some(approval.run_id),
                            "approval",
                            "approval_expired",
                            serde_json::json!({ "approval_id": approval_id, "actor": actor }),
                        )
                        .await?;
                }
                Ok(Reply {
                    run_id: None,
                    text: format!(
                        "Approval {approval_id} expired before a decision; submit the request again."
                    ),
                })
            }
            ApprovalTransition::NotFound => Ok(Reply {
                run_id: None,
                text: format!("No approval {approval_id} found."),
            }),
        }
    }

    async fn run_approval_control(
        &self,
        _session: &Session,
        control_run: &Run,
        parsed: &ParsedCommand,
        approve: bool,
        event: &InboundEvent,
    ) -> Result<Reply> {
        self.transition(control_run.id, RunState::Running, None, None)
            .await?;

        let decision = match parsed
            .target
            .as_deref()
            .map(str::parse::<Uuid>)
        {
            Some(Ok(approval_id)) => {
                self.resolve_approval_decision(Some(&event.sender), approval_id, approve)
                    .await?
            }
            _ => Reply {
                run_id: None,
                text: format!(
                    "Usage: {} <approval-id>",
                    if approve { "approve" } else { "deny" }
                ),
            },
        };

        self.transition(
            control_run.id,
            RunState::Completed,
            Some(&decision.text),
            None,
        )
        .await?;
        Ok(Reply {
            run_id: decision.run_id.or(Some(control_run.id)),
            text: decision.text,
        })
    }

    // ---- connector ----

    /// Runs the connector with the store lock released, a bounded timeout,
    /// and an externally cancellable token registered for this run.
    async fn execute_via_connector(
        &self,
        session: &Session,
        run: &Run,
        channel: Option<&str>,
    ) -> Result<String> {
        self.transition(run.id, RunState::Running, None, None).await?;

        let ctx = ExecutionContext {
            run_id: run.id.to_string(),
            sender: session.sender.clone(),
            workspace: session.workspace.clone(),
            channel: channel.map(ToOwned::to_owned),
        };
        let cancel = self.shutdown.child_token();
        self.in_flight.insert(run.id, cancel.clone());
        let result = self
            .connector
            .run(&ctx, &run.payload, self.connector_timeout, &cancel)
            .await;
        self.in_flight.remove(&run.id);

        match result {
            Ok(outcome) if outcome.success => {
                self.transition(run.id, RunState::Completed, Some(&outcome.output), None)
                    .await?;
                Ok(outcome.output)
            }
            Ok(outcome) => {
                let detail = outcome
                    .error
                    .unwrap_or_else(|| "backend reported failure".to_string());
                self.transition(run.id, RunState::Failed, None, Some(&detail))
                    .await?;
                Ok(format!("Run failed: {detail}"))
            }
            Err(e) => {
                let detail = e.to_string();
                self.transition(run.id, RunState::Failed, None, Some(&detail))
                    .await?;
                Ok(format!("Run failed: {detail}"))
            }
        }
    }

    /// Every run state transition persists and audits exactly once.
    async fn transition(
        &self,
        run_id: Uuid,
        state: RunState,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        self.store.set_run_state(run_id, state, result, error).await?;
        self.store
            .append_audit(
                Some(run_id),
                "orchestrator",
                "run_state",
                serde_json::json!({ "state": state.as_str(), "error": error }),
            )
            .await?;
        Ok(())
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(max).collect();
    format!("{head}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use relay_connector::ExecutionOutcome;
    use relay_store::ApprovalStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedConnector {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ExecutionConnector for ScriptedConnector {
        fn connector_id(&self) -> &str {
            "scripted"
        }

        async fn run(
            &self,
            _ctx: &ExecutionContext,
            command_text: &str,
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> relay_connector::Result<ExecutionOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Ok(ExecutionOutcome {
                    success: false,
                    output: String::new(),
                    error: Some("backend exploded".to_string()),
                });
            }
            Ok(ExecutionOutcome {
                success: true,
                output: format!("did: {command_text}"),
                error: None,
            })
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        store: Store,
        calls: Arc<AtomicUsize>,
    }

    async fn harness(fail: bool, ttl: ChronoDuration) -> Harness {
        let store = Store::open_in_memory().await.expect("open store");
        let calls = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(ScriptedConnector {
            calls: calls.clone(),
            fail,
        });
        let policy = ApprovalPolicy {
            ttl,
            sweep_interval: Duration::from_secs(60),
        };
        let orchestrator = Orchestrator::new(
            store.clone(),
            connector,
            HashMap::new(),
            "home".to_string(),
            vec!["home".to_string(), "work".to_string()],
            policy,
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        Harness {
            orchestrator,
            store,
            calls,
        }
    }

    fn event(external_id: &str, sender: &str, body: &str) -> InboundEvent {
        InboundEvent {
            channel: "messages".to_string(),
            external_id: external_id.to_string(),
            sender: sender.to_string(),
            title: None,
            body: body.to_string(),
            target: None,
            context: serde_json::Value::Null,
        }
    }

    async fn pending_approval_id(store: &Store) -> Uuid {
        let pending = store
            .list_approvals(Some(ApprovalStatus::Pending), 10)
            .await
            .expect("list pending");
        assert_eq!(pending.len(), 1);
        pending[0].id
    }

    #[tokio::test]
    async fn chat_runs_to_completion_without_an_approval() {
        let h = harness(false, ChronoDuration::minutes(30)).await;
        let reply = h
            .orchestrator
            .handle_inbound(event("m-1", "alice", "what's on my calendar"))
            .await
            .expect("handle")
            .expect("reply");
        assert_eq!(reply.text, "did: what's on my calendar");
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        let runs = h.store.list_runs(10).await.expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].state, RunState::Completed);
        assert!(h
            .store
            .list_approvals(None, 10)
            .await
            .expect("approvals")
            .is_empty());
    }

    #[tokio::test]
    async fn duplicate_external_id_produces_no_new_run() {
        let h = harness(false, ChronoDuration::minutes(30)).await;
        h.orchestrator
            .handle_inbound(event("m-1", "alice", "hello"))
            .await
            .expect("first")
            .expect("reply");
        let second = h
            .orchestrator
            .handle_inbound(event("m-1", "alice", "hello"))
            .await
            .expect("second");
        assert!(second.is_none());
        assert_eq!(h.store.list_runs(10).await.expect("runs").len(), 1);
    }

    #[tokio::test]
    async fn task_waits_for_approval_then_executes_on_approve() {
        let h = harness(false, ChronoDuration::minutes(30)).await;
        let reply = h
            .orchestrator
            .handle_inbound(event("m-1", "alice", "task: deploy service"))
            .await
            .expect("task")
            .expect("reply");
        assert!(reply.text.contains("Approval required"));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        let task_run = reply.run_id.expect("run id");
        let run = h
            .store
            .get_run(task_run)
            .await
            .expect("get")
            .expect("some");
        assert_eq!(run.state, RunState::AwaitingApproval);

        let approval_id = pending_approval_id(&h.store).await;
        let approve_reply = h
            .orchestrator
            .handle_inbound(event("m-2", "alice", &format!("approve {approval_id}")))
            .await
            .expect("approve")
            .expect("reply");
        assert!(approve_reply.text.contains("Approved"));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        let run = h
            .store
            .get_run(task_run)
            .await
            .expect("get")
            .expect("some");
        assert_eq!(run.state, RunState::Completed);
        let approval = h
            .store
            .get_approval(approval_id)
            .await
            .expect("get")
            .expect("some");
        assert_eq!(approval.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn foreign_sender_cannot_approve() {
        let h = harness(false, ChronoDuration::minutes(30)).await;
        h.orchestrator
            .handle_inbound(event("m-1", "alice", "task: deploy service"))
            .await
            .expect("task")
            .expect("reply");
        let approval_id = pending_approval_id(&h.store).await;

        let reply = h
            .orchestrator
            .handle_inbound(event("m-2", "mallory", &format!("approve {approval_id}")))
            .await
            .expect("approve")
            .expect("reply");
        assert!(reply.text.contains("original requester"));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        let approval = h
            .store
            .get_approval(approval_id)
            .await
            .expect("get")
            .expect("some");
        assert_eq!(approval.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn deny_terminates_the_run_without_execution() {
        let h = harness(false, ChronoDuration::minutes(30)).await;
        let task = h
            .orchestrator
            .handle_inbound(event("m-1", "alice", "task: archive old mail"))
            .await
            .expect("task")
            .expect("reply");
        let approval_id = pending_approval_id(&h.store).await;

        let reply = h
            .orchestrator
            .handle_inbound(event("m-2", "alice", &format!("deny {approval_id}")))
            .await
            .expect("deny")
            .expect("reply");
        assert!(reply.text.contains("Denied"));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        let run = h
            .store
            .get_run(task.run_id.expect("run id"))
            .await
            .expect("get")
            .expect("some");
        assert_eq!(run.state, RunState::Denied);
    }

    #[tokio::test]
    async fn approve_after_deadline_is_rejected_and_run_expires() {
        let h = harness(false, ChronoDuration::seconds(-1)).await;
        let task = h
            .orchestrator
            .handle_inbound(event("m-1", "alice", "task: deploy service"))
            .await
            .expect("task")
            .expect("reply");
        let approval_id = pending_approval_id(&h.store).await;

        let reply = h
            .orchestrator
            .handle_inbound(event("m-2", "alice", &format!("approve {approval_id}")))
            .await
            .expect("approve")
            .expect("reply");
        assert!(reply.text.contains("expired"));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        let run = h
            .store
            .get_run(task.run_id.expect("run id"))
            .await
            .expect("get")
            .expect("some");
        assert_eq!(run.state, RunState::Expired);
        let approval = h
            .store
            .get_approval(approval_id)
            .await
            .expect("get")
            .expect("some");
        assert_eq!(approval.status, ApprovalStatus::Expired);
    }

    #[tokio::test]
    async fn replayed_decision_is_a_no_op_with_conflict_audit() {
        let h = harness(false, ChronoDuration::minutes(30)).await;
        h.orchestrator
            .handle_inbound(event("m-1", "alice", "task: deploy service"))
            .await
            .expect("task")
            .expect("reply");
        let approval_id = pending_approval_id(&h.store).await;

        h.orchestrator
            .handle_inbound(event("m-2", "alice", &format!("approve {approval_id}")))
            .await
            .expect("approve")
            .expect("reply");
        let replay = h
            .orchestrator
            .handle_inbound(event("m-3", "alice", &format!("approve {approval_id}")))
            .await
            .expect("replay")
            .expect("reply");
        assert!(replay.text.contains("already approved"));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        let tail = h.store.audit_tail(50).await.expect("tail");
        assert!(tail.iter().any(|e| e.event == "approval_conflict"));
    }

    #[tokio::test]
    async fn unknown_alias_falls_back_and_is_reported() {
        let h = harness(false, ChronoDuration::minutes(30)).await;
        let reply = h
            .orchestrator
            .handle_inbound(event("m-1", "alice", "hello there @nowhere"))
            .await
            .expect("handle")
            .expect("reply");
        assert!(reply.text.starts_with("Unknown workspace @nowhere"));

        let sessions = h.store.list_sessions().await.expect("sessions");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].workspace, "home");
    }

    #[tokio::test]
    async fn connector_failure_marks_run_failed_with_detail() {
        let h = harness(true, ChronoDuration::minutes(30)).await;
        let reply = h
            .orchestrator
            .handle_inbound(event("m-1", "alice", "summarize my inbox"))
            .await
            .expect("handle")
            .expect("reply");
        assert!(reply.text.contains("backend exploded"));

        let runs = h.store.list_runs(10).await.expect("runs");
        assert_eq!(runs[0].state, RunState::Failed);
        assert_eq!(runs[0].error.as_deref(), Some("backend exploded"));
    }

    #[tokio::test]
    async fn admin_override_skips_requester_guard_but_not_pending_guard() {
        let h = harness(false, ChronoDuration::minutes(30)).await;
        h.orchestrator
            .handle_inbound(event("m-1", "alice", "task: deploy service"))
            .await
            .expect("task")
            .expect("reply");
        let approval_id = pending_approval_id(&h.store).await;

        let reply = h
            .orchestrator
            .resolve_approval_decision(None, approval_id, true)
            .await
            .expect("override");
        assert!(reply.text.contains("Approved"));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        let replay = h
            .orchestrator
            .resolve_approval_decision(None, approval_id, false)
            .await
            .expect("override replay");
        assert!(replay.text.contains("already approved"));
    }
}
