use crate::server::RelayState;
use axum::extract::{Path, Query};
use axum::routing::{get, post};
use axum::{Extension, Json};
use relay_store::ApprovalStatus;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListApprovalsQuery {
    status: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OverrideRequest {
    decision: String,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/relay/approvals", get(list_approvals))
        .route(
            "/api/v1/relay/approvals/{id}/override",
            post(override_approval),
        )
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_approvals(
    Extension(state): Extension<Arc<RelayState>>,
    Query(query): Query<ListApprovalsQuery>,
) -> Json<serde_json::Value> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match ApprovalStatus::parse(raw) {
            Ok(status) => Some(status),
            Err(_) => {
                return Json(serde_json::json!({
                    "status": "error",
                    "error": format!("unknown approval status filter {raw:?}"),
                }));
            }
        },
    };
    let limit = query.limit.unwrap_or(50).min(500);
    match state.store.list_approvals(status, limit).await {
        Ok(approvals) => Json(serde_json::json!({ "status": "ok", "approvals": approvals })),
        Err(e) => Json(serde_json::json!({ "status": "degraded", "error": e.to_string() })),
    }
}

/// Administrative override: same guarded transition as a sender decision,
/// minus the requester check. A non-pending request stays untouched.
#[tracing::instrument(level = "info", skip_all)]
async fn override_approval(
    Extension(state): Extension<Arc<RelayState>>,
    Path(id): Path<String>,
    Json(req): Json<OverrideRequest>,
) -> Json<serde_json::Value> {
    let Ok(id) = Uuid::parse_str(&id) else {
        return Json(serde_json::json!({ "status": "error", "error": "invalid approval id" }));
    };
    let approve = match req.decision.to_ascii_lowercase().as_str() {
        "approve" | "approved" => true,
        "deny" | "denied" => false,
        other => {
            return Json(serde_json::json!({
                "status": "error",
                "error": format!("decision must be approve or deny, got {other:?}"),
            }));
        }
    };

    match state
        .orchestrator
        .resolve_approval_decision(None, id, approve)
        .await
    {
        Ok(reply) => Json(serde_json::json!({
            "status": "ok",
            "run_id": reply.run_id,
            "detail": reply.text,
        })),
        Err(e) => Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    }
}
