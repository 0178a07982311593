use crate::traits::ChannelAdapter;
use crate::types::{ChannelBatch, ChannelItem};
use anyhow::{Result, anyhow};
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;

/// Generic bridge to a native channel-store wrapper speaking HTTP.
///
/// The wrapper owns the platform I/O (Mail, Reminders, Notes, Calendar,
/// Messages); this adapter only moves normalized items across the wire.
/// Poll: `GET {poll_url}?cursor=<cursor>`. Egress: `POST {write_url}` with
/// `{target_id, text}`.
#[derive(Clone)]
pub struct HttpBridgeAdapter {
    http: reqwest::Client,
    channel_id: String,
    poll_url: String,
    write_url: String,
    auth_token: Option<String>,
    title_bearing: bool,
}

impl HttpBridgeAdapter {
    pub fn new(channel_id: &str, poll_url: &str, write_url: &str) -> Result<Self> {
        let channel_id = normalize_channel_id(channel_id)?;
        let poll_url = normalize_http_url(poll_url, "poll_url")?;
        let write_url = normalize_http_url(write_url, "write_url")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            channel_id,
            poll_url,
            write_url,
            auth_token: None,
            title_bearing: false,
        })
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn with_title_bearing(mut self, title_bearing: bool) -> Self {
        self.title_bearing = title_bearing;
        self
    }

    fn authorized_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for HttpBridgeAdapter {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    async fn poll(&self, since_cursor: Option<&str>) -> Result<ChannelBatch> {
        let mut url = Url::parse(&self.poll_url)
            .map_err(|e| anyhow!("invalid poll_url for channel {}: {e}", self.channel_id))?;
        if let Some(cursor) = since_cursor {
            url.query_pairs_mut().append_pair("cursor", cursor);
        }

        let response = self.authorized_request(self.http.get(url)).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "bridge poll failed for channel {}: status={} body={}",
                self.channel_id,
                status,
                body
            ));
        }
        let batch = extract_batch(body);
        tracing::debug!(
            channel_id = %self.channel_id,
            items = batch.items.len(),
            next_cursor = ?batch.next_cursor,
            "bridge poll complete"
        );
        Ok(batch)
    }

    async fn write_result(&self, target_id: &str, text: &str) -> Result<()> {
        let target_id = target_id.trim();
        if target_id.is_empty() {
            return Err(anyhow!("target_id is required"));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("result text is empty"));
        }

        let payload = serde_json::json!({
            "channel_id": self.channel_id,
            "target_id": target_id,
            "text": text,
        });
        let response = self
            .authorized_request(self.http.post(self.write_url.as_str()))
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "bridge write failed for channel {}: status={} body={}",
                self.channel_id,
                status,
                body
            ));
        }
        Ok(())
    }

    fn title_bearing(&self) -> bool {
        self.title_bearing
    }
}

fn normalize_channel_id(raw: &str) -> Result<String> {
    let channel_id = raw.trim().to_ascii_lowercase();
    if channel_id.is_empty() {
        return Err(anyhow!("channel id is required"));
    }
    if !channel_id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        return Err(anyhow!("invalid channel id {:?}: use [a-z0-9_-]+", raw));
    }
    Ok(channel_id)
}

fn normalize_http_url(raw: &str, field: &str) -> Result<String> {
    let normalized = raw.trim().to_string();
    if normalized.is_empty() {
        return Err(anyhow!("{field} is required"));
    }
    let parsed = Url::parse(&normalized).map_err(|e| anyhow!("invalid {field}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(normalized),
        other => Err(anyhow!("invalid {field} scheme: {other}")),
    }
}

/// Accepts either a bare array of items or `{"items": [...], "cursor": "..."}`.
fn extract_batch(body: serde_json::Value) -> ChannelBatch {
    match body {
        serde_json::Value::Array(items) => ChannelBatch {
            items: parse_items(items),
            next_cursor: None,
        },
        serde_json::Value::Object(mut obj) => {
            let next_cursor = obj
                .get("cursor")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(ToOwned::to_owned);
            let items = obj
                .remove("items")
                .and_then(|value| match value {
                    serde_json::Value::Array(items) => Some(parse_items(items)),
                    _ => None,
                })
                .unwrap_or_default();
            ChannelBatch { items, next_cursor }
        }
        _ => ChannelBatch::default(),
    }
}

fn parse_items(raw: Vec<serde_json::Value>) -> Vec<ChannelItem> {
    raw.into_iter()
        .filter_map(|value| {
            let envelope: BridgeItemEnvelope = serde_json::from_value(value).ok()?;
            envelope.into_item()
        })
        .collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct BridgeItemEnvelope {
    external_id: Option<String>,
    sender: Option<String>,
    title: Option<String>,
    body: Option<String>,
    target: Option<String>,
    context: Option<serde_json::Value>,
}

impl BridgeItemEnvelope {
    fn into_item(self) -> Option<ChannelItem> {
        let external_id = self
            .external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())?
            .to_string();
        let sender = self
            .sender
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())?
            .to_string();
        let body = self.body.as_deref().map(str::trim).unwrap_or_default();
        let title = self
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToOwned::to_owned);
        if body.is_empty() && title.is_none() {
            return None;
        }
        let target = self
            .target
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(Into::into);
        Some(ChannelItem {
            external_id: external_id.into(),
            sender: sender.into(),
            title,
            body: body.to_string(),
            target,
            context: self.context.unwrap_or(serde_json::Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{extract_batch, normalize_channel_id, normalize_http_url};

    #[test]
    fn normalize_channel_id_enforces_identifier_policy() {
        assert_eq!(
            normalize_channel_id("Reminders").expect("valid id"),
            "reminders"
        );
        assert!(normalize_channel_id("bad id").is_err());
        assert!(normalize_channel_id("  ").is_err());
    }

    #[test]
    fn normalize_http_url_requires_http_or_https() {
        assert_eq!(
            normalize_http_url("https://bridge.local/mail/poll", "poll_url")
                .expect("https url should be valid"),
            "https://bridge.local/mail/poll"
        );
        assert!(normalize_http_url("file:///etc/passwd", "poll_url").is_err());
    }

    #[test]
    fn extract_batch_supports_array_and_wrapped_shape() {
        let array_payload = serde_json::json!([
            {"external_id": "m1", "sender": "alice", "body": "hi"}
        ]);
        let wrapped_payload = serde_json::json!({
            "cursor": "99",
            "items": [
                {"external_id": "m2", "sender": "bob", "body": "hello", "target": "thread-7"}
            ]
        });

        let from_array = extract_batch(array_payload);
        let from_wrapped = extract_batch(wrapped_payload);
        assert_eq!(from_array.items.len(), 1);
        assert!(from_array.next_cursor.is_none());
        assert_eq!(from_wrapped.items.len(), 1);
        assert_eq!(from_wrapped.next_cursor.as_deref(), Some("99"));
        assert_eq!(from_wrapped.items[0].target.as_deref(), Some("thread-7"));
    }

    #[test]
    fn extract_batch_drops_items_missing_identity() {
        let payload = serde_json::json!({
            "items": [
                {"sender": "alice", "body": "no id"},
                {"external_id": "m3", "body": "no sender"},
                {"external_id": "m4", "sender": "carol", "title": "Lunch?", "body": ""}
            ]
        });
        let batch = extract_batch(payload);
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].external_id.as_str(), "m4");
        assert_eq!(batch.items[0].title.as_deref(), Some("Lunch?"));
    }
}
