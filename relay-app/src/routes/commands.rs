use crate::orchestrator::InboundEvent;
use crate::server::RelayState;
use axum::routing::post;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Programmatic command submission, bypassing channel polling. Items arrive
/// on the synthetic "api" channel; replies come back in the response body
/// instead of a channel write.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmitCommandRequest {
    sender: String,
    text: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    external_id: Option<String>,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/relay/commands", post(submit_command))
}

#[tracing::instrument(level = "info", skip_all)]
async fn submit_command(
    Extension(state): Extension<Arc<RelayState>>,
    Json(req): Json<SubmitCommandRequest>,
) -> Json<serde_json::Value> {
    let sender = req.sender.trim();
    if sender.is_empty() {
        return Json(serde_json::json!({ "status": "error", "error": "sender is required" }));
    }
    if req.text.trim().is_empty() && req.title.as_deref().map(str::trim).unwrap_or_default().is_empty() {
        return Json(serde_json::json!({ "status": "error", "error": "text is required" }));
    }

    let event = InboundEvent {
        channel: "api".to_string(),
        external_id: req
            .external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        sender: sender.to_string(),
        title: req.title,
        body: req.text,
        target: None,
        context: serde_json::json!({ "source": "admin_api" }),
    };

    match state.orchestrator.handle_inbound(event).await {
        Ok(Some(reply)) => Json(serde_json::json!({
            "status": "ok",
            "run_id": reply.run_id,
            "reply": reply.text,
        })),
        Ok(None) => Json(serde_json::json!({ "status": "duplicate" })),
        Err(e) => Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
    }
}
