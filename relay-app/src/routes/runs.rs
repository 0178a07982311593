use crate::server::RelayState;
use axum::extract::{Path, Query};
use axum::routing::get;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListRunsQuery {
    limit: Option<usize>,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/relay/runs", get(list_runs))
        .route("/api/v1/relay/runs/{id}", get(get_run))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_runs(
    Extension(state): Extension<Arc<RelayState>>,
    Query(query): Query<ListRunsQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(50).min(500);
    match state.store.list_runs(limit).await {
        Ok(runs) => Json(serde_json::json!({ "status": "ok", "runs": runs })),
        Err(e) => Json(serde_json::json!({ "status": "degraded", "error": e.to_string() })),
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_run(
    Extension(state): Extension<Arc<RelayState>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let Ok(id) = Uuid::parse_str(&id) else {
        return Json(serde_json::json!({ "status": "error", "error": "invalid run id" }));
    };
    let run = match state.store.get_run(id).await {
        Ok(Some(run)) => run,
        Ok(None) => return Json(serde_json::json!({ "status": "not_found" })),
        Err(e) => {
            return Json(serde_json::json!({ "status": "degraded", "error": e.to_string() }));
        }
    };
    let audit = match state.store.audit_for_run(id).await {
        Ok(audit) => audit,
        Err(e) => {
            return Json(serde_json::json!({ "status": "degraded", "error": e.to_string() }));
        }
    };
    Json(serde_json::json!({ "status": "ok", "run": run, "audit": audit }))
}
