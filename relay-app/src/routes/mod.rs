pub mod approvals;
pub mod audit;
pub mod commands;
pub mod health;
pub mod metrics;
pub mod runs;
pub mod sessions;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(metrics::router())
        .merge(sessions::router())
        .merge(approvals::router())
        .merge(runs::router())
        .merge(audit::router())
        .merge(commands::router())
}
