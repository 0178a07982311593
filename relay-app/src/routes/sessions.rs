use crate::server::RelayState;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/relay/sessions", get(list_sessions))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_sessions(Extension(state): Extension<Arc<RelayState>>) -> Json<serde_json::Value> {
    match state.store.list_sessions().await {
        Ok(sessions) => Json(serde_json::json!({ "status": "ok", "sessions": sessions })),
        Err(e) => Json(serde_json::json!({ "status": "degraded", "error": e.to_string() })),
    }
}
