use crate::server::RelayState;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/relay/metrics", get(get_metrics))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_metrics(Extension(state): Extension<Arc<RelayState>>) -> Json<serde_json::Value> {
    match state.store.metrics().await {
        Ok(metrics) => Json(serde_json::json!({ "status": "ok", "metrics": metrics })),
        Err(e) => Json(serde_json::json!({ "status": "degraded", "error": e.to_string() })),
    }
}
