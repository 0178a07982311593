//! Bearer-token gate for the admin control plane.
//!
//! Read endpoints stay open; mutating endpoints (override, programmatic
//! command submit) require one of the configured control tokens. With no
//! tokens configured the plane is expected to sit on a loopback bind and
//! mutating requests are let through.

use crate::config::RelayConfig;
use axum::Json;
use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, Clone)]
pub struct AdminAuthPolicy {
    pub control_tokens: Vec<String>,
    pub require_auth_for_mutating: bool,
}

impl AdminAuthPolicy {
    pub fn from_config(cfg: &RelayConfig) -> Self {
        let control_tokens = cfg
            .admin
            .control_tokens
            .iter()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .collect::<Vec<_>>();
        Self {
            require_auth_for_mutating: !control_tokens.is_empty(),
            control_tokens,
        }
    }

    fn accepts(&self, provided: &str) -> bool {
        self.control_tokens.iter().any(|token| token == provided)
    }
}

#[derive(Debug, Clone)]
pub struct AdminAuthPolicyExt(pub AdminAuthPolicy);

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn parse_bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let mut parts = raw.trim().splitn(2, char::is_whitespace);
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn unauthorized(message: impl Into<String>) -> Response {
    let message = message.into();
    tracing::warn!(error = %message, "admin auth rejected");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "status": "error", "error": message })),
    )
        .into_response()
}

pub async fn require_admin_auth(
    axum::Extension(policy): axum::Extension<AdminAuthPolicyExt>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !is_mutating(request.method()) {
        return next.run(request).await;
    }
    let policy = &policy.0;
    if !policy.require_auth_for_mutating {
        return next.run(request).await;
    }
    let Some(token) = parse_bearer_token(request.headers()) else {
        return unauthorized("missing bearer token on mutating request");
    };
    if !policy.accepts(&token) {
        return unauthorized("control token not recognized");
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn parse_bearer_token_handles_scheme_and_whitespace() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer  secret-1 "));
        assert_eq!(parse_bearer_token(&headers).as_deref(), Some("secret-1"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert!(parse_bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(parse_bearer_token(&headers).is_none());
    }

    #[test]
    fn policy_requires_auth_only_when_tokens_are_configured() {
        let cfg: RelayConfig = toml::from_str(
            r#"
[connector]
kind = "subprocess"
program = "relay-backend"

[admin]
control_tokens = [" secret-1 ", ""]
"#,
        )
        .expect("parse config");
        let policy = AdminAuthPolicy::from_config(&cfg);
        assert!(policy.require_auth_for_mutating);
        assert_eq!(policy.control_tokens, vec!["secret-1"]);
        assert!(policy.accepts("secret-1"));
        assert!(!policy.accepts("secret-2"));

        let cfg: RelayConfig = toml::from_str(
            r#"
[connector]
kind = "subprocess"
program = "relay-backend"
"#,
        )
        .expect("parse config");
        let policy = AdminAuthPolicy::from_config(&cfg);
        assert!(!policy.require_auth_for_mutating);
    }
}
