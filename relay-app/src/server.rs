//! relayd server: store bootstrap, channel pollers, orchestrator, and the
//! admin HTTP plane.

use crate::approvals::{self, ApprovalPolicy};
use crate::config::{ConnectorKind, RelayConfig};
use crate::http_auth::{self, AdminAuthPolicy};
use crate::orchestrator::Orchestrator;
use crate::pollers::{self, PollerBoard};
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use chrono::Utc;
use dashmap::DashMap;
use relay_channels::{ChannelAdapter, HttpBridgeAdapter};
use relay_connector::{ExecutionConnector, HttpConnector, SubprocessConnector};
use relay_store::Store;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub struct RelayState {
    pub store: Store,
    pub orchestrator: Arc<Orchestrator>,
    pub poller_board: PollerBoard,
    pub started_at: Instant,
    pub channel_count: usize,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = RelayConfig::load_with_path(config_path).await?;
    let channel_count = cfg.enabled_channels().count();
    tracing::info!(
        config_path = %path.display(),
        default_workspace = %cfg.general.default_workspace,
        approval_ttl_minutes = cfg.general.approval_ttl_minutes,
        connector_kind = ?cfg.connector.kind,
        store_path = %cfg.store_path()?.display(),
        enabled_channels = channel_count,
        control_tokens = cfg.admin.control_tokens.len(),
        "config ok"
    );
    if channel_count == 0 {
        tracing::warn!("no channels enabled; only the admin command endpoint will produce work");
    }
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let store = Store::open(cfg.store_path()?).await?;
    let started_at = store.get_meta("started_at").await?;
    let instance_id = store.get_meta("instance_id").await?;
    let metrics = store.metrics().await?;
    tracing::info!(
        started_at = ?started_at,
        instance_id = ?instance_id,
        sessions = metrics.sessions,
        audit_events = metrics.audit_events,
        runs_by_state = ?metrics.runs_by_state,
        approvals_by_status = ?metrics.approvals_by_status,
        "status ok"
    );
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    channel: &str,
    target: &str,
    text: &str,
) -> Result<()> {
    let cfg = RelayConfig::load(config_path).await?;
    let Some(channel_cfg) = cfg.channels.get(channel) else {
        return Err(anyhow::anyhow!("unknown channel: {channel}"));
    };
    let adapter = HttpBridgeAdapter::new(channel, &channel_cfg.poll_url, &channel_cfg.write_url)?
        .with_auth_token(channel_cfg.auth_token.clone());
    adapter.write_result(target, text).await?;
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = RelayConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    let addr: SocketAddr = cfg
        .admin
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid admin.bind_addr {:?}: {e}", cfg.admin.bind_addr))?;

    let enabled: Vec<&String> = cfg.enabled_channels().map(|(name, _)| name).collect();
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        default_workspace = %cfg.general.default_workspace,
        approval_ttl_minutes = cfg.general.approval_ttl_minutes,
        sweep_interval_seconds = cfg.general.sweep_interval_seconds,
        connector_kind = ?cfg.connector.kind,
        connector_timeout_seconds = cfg.connector.timeout_seconds,
        enabled_channels = ?enabled,
        http_timeout_seconds = cfg.admin.http_timeout_seconds,
        http_max_in_flight = cfg.admin.http_max_in_flight,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let store_path = cfg.store_path()?;
    if let Some(parent) = store_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| anyhow::anyhow!("create data dir {}: {e}", parent.display()))?;
    }
    let store = Store::open(&store_path).await?;

    // Daemon-wide mutable state lives in the store, not process memory, so
    // restarts are observable from the admin plane.
    let instance_id = Uuid::new_v4();
    store.set_meta("instance_id", &instance_id.to_string()).await?;
    store.set_meta("started_at", &Utc::now().to_rfc3339()).await?;
    store
        .append_audit(
            None,
            "daemon",
            "daemon_started",
            serde_json::json!({ "instance_id": instance_id, "channels": enabled }),
        )
        .await?;

    let (channels, intervals) = build_channels(&cfg)?;
    let connector = build_connector(&cfg)?;
    tracing::info!(
        connector = connector.connector_id(),
        channel_count = channels.len(),
        "runtime assembled"
    );

    let shutdown = CancellationToken::new();
    let approval_policy = ApprovalPolicy::new(
        cfg.general.approval_ttl_minutes,
        cfg.general.sweep_interval_seconds,
    );
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        connector,
        channels.clone(),
        cfg.general.default_workspace.clone(),
        cfg.known_workspaces(),
        approval_policy,
        Duration::from_secs(cfg.connector.timeout_seconds),
        shutdown.clone(),
    ));

    let poller_board: PollerBoard = Arc::new(DashMap::new());
    let poller_handles = pollers::spawn_pollers(
        &channels,
        &intervals,
        store.clone(),
        orchestrator.clone(),
        poller_board.clone(),
        shutdown.child_token(),
    );
    let sweeper_handle = approvals::spawn_sweeper(
        store.clone(),
        approval_policy.sweep_interval,
        shutdown.child_token(),
    );

    let state = Arc::new(RelayState {
        store: store.clone(),
        orchestrator,
        poller_board,
        started_at,
        channel_count: channels.len(),
    });
    let auth_policy = AdminAuthPolicy::from_config(&cfg);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        );

    let app = routes::router()
        .layer(axum::middleware::from_fn(http_auth::require_admin_auth))
        .layer(Extension(http_auth::AdminAuthPolicyExt(auth_policy)))
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.admin.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.admin.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "relayd serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match tokio::time::timeout(Duration::from_secs(5), sweeper_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "sweeper task join failed during shutdown"),
        Err(_) => tracing::warn!("timed out waiting for sweeper shutdown"),
    }
    for handle in poller_handles {
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "poller task join failed during shutdown"),
            Err(_) => tracing::warn!("timed out waiting for poller shutdown"),
        }
    }
    store
        .append_audit(
            None,
            "daemon",
            "daemon_stopped",
            serde_json::json!({ "instance_id": instance_id }),
        )
        .await?;

    Ok(())
}

type ChannelMap = HashMap<String, Arc<dyn ChannelAdapter>>;

fn build_channels(cfg: &RelayConfig) -> Result<(ChannelMap, HashMap<String, Duration>)> {
    let mut channels: ChannelMap = HashMap::new();
    let mut intervals = HashMap::new();
    for (name, channel_cfg) in cfg.enabled_channels() {
        let adapter = HttpBridgeAdapter::new(name, &channel_cfg.poll_url, &channel_cfg.write_url)?
            .with_auth_token(channel_cfg.auth_token.clone())
            .with_title_bearing(channel_cfg.title_bearing);
        channels.insert(name.clone(), Arc::new(adapter));
        intervals.insert(
            name.clone(),
            Duration::from_millis(channel_cfg.poll_interval_ms),
        );
    }
    Ok((channels, intervals))
}

fn build_connector(cfg: &RelayConfig) -> Result<Arc<dyn ExecutionConnector>> {
    match cfg.connector.kind {
        ConnectorKind::Subprocess => {
            let program = cfg
                .connector
                .program
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("connector.program is required"))?;
            Ok(Arc::new(SubprocessConnector::new(
                program,
                cfg.connector.args.clone(),
            )))
        }
        ConnectorKind::Http => {
            let url = cfg
                .connector
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("connector.url is required"))?;
            Ok(Arc::new(
                HttpConnector::new(url)?.with_auth_token(cfg.connector.auth_token.clone()),
            ))
        }
    }
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
