use crate::server::RelayState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/relay/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<RelayState>>) -> Json<serde_json::Value> {
    let pollers: BTreeMap<String, crate::pollers::PollerStatus> = state
        .poller_board
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();

    // A store that cannot answer reads degrades the health report; it does
    // not fail the endpoint.
    let (status, started_at) = match state.store.get_meta("started_at").await {
        Ok(meta) => ("ok", meta),
        Err(e) => {
            tracing::warn!(error = %e, "health read degraded");
            ("degraded", None)
        }
    };

    Json(serde_json::json!({
        "status": status,
        "ready": status == "ok",
        "checked_at": Utc::now(),
        "started_at": started_at,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "channels": state.channel_count,
        "pollers": pollers,
    }))
}
