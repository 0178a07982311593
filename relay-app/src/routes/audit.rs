use crate::server::RelayState;
use axum::extract::Query;
use axum::routing::get;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuditTailQuery {
    limit: Option<usize>,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/relay/audit", get(audit_tail))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn audit_tail(
    Extension(state): Extension<Arc<RelayState>>,
    Query(query): Query<AuditTailQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(100).min(1000);
    match state.store.audit_tail(limit).await {
        Ok(events) => Json(serde_json::json!({ "status": "ok", "events": events })),
        Err(e) => Json(serde_json::json!({ "status": "degraded", "error": e.to_string() })),
    }
}
