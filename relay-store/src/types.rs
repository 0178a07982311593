use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// Lifecycle of one execution attempt. `AwaitingApproval` is a run state,
/// not a separate entity: a run exists before approval or execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    AwaitingApproval,
    Running,
    Completed,
    Failed,
    Expired,
    Denied,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Denied => "denied",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "queued" => Ok(Self::Queued),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            "denied" => Ok(Self::Denied),
            other => Err(StoreError::InvalidValue(format!("run state: {other:?}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Expired | Self::Denied
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "denied" => Ok(Self::Denied),
            "expired" => Ok(Self::Expired),
            other => Err(StoreError::InvalidValue(format!(
                "approval status: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a guarded approval transition. Everything except `Applied`
/// leaves the row unchanged; `AlreadyExpired` means the guard marked the row
/// expired because its deadline had passed before the transition was tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalTransition {
    Applied,
    NotFound,
    NotPending(ApprovalStatus),
    WrongSender,
    AlreadyExpired,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub sender: String,
    pub workspace: String,
    pub last_channel: Option<String>,
    pub last_target: Option<String>,
    pub mode: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Input shape for ingestion; the store assigns the row id and enforces
/// uniqueness on (channel, external_id).
#[derive(Debug, Clone)]
pub struct NewInboundMessage {
    pub channel: String,
    pub external_id: String,
    pub sender: String,
    pub title: Option<String>,
    pub body: String,
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct InboundMessage {
    pub id: Uuid,
    pub channel: String,
    pub external_id: String,
    pub sender: String,
    pub title: Option<String>,
    pub body: String,
    pub context: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted(Uuid),
    Duplicate,
}

#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: Uuid,
    pub session_id: Uuid,
    pub kind: String,
    pub state: RunState,
    pub payload: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub run_id: Uuid,
    pub requester: String,
    pub summary: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: i64,
    pub run_id: Option<Uuid>,
    pub step: String,
    pub event: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreMetrics {
    pub sessions: i64,
    pub inbound_by_channel: Vec<(String, i64)>,
    pub runs_by_state: Vec<(String, i64)>,
    pub approvals_by_status: Vec<(String, i64)>,
    pub audit_events: i64,
}
