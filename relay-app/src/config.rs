//! relayd configuration loader.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_workspace")]
    pub default_workspace: String,
    /// Known workspace aliases. The default workspace is always included.
    #[serde(default)]
    pub workspaces: Vec<String>,
    #[serde(default = "default_approval_ttl_minutes")]
    pub approval_ttl_minutes: u64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_workspace: default_workspace(),
            workspaces: Vec::new(),
            approval_ttl_minutes: default_approval_ttl_minutes(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Bearer tokens accepted on mutating admin requests. Empty means the
    /// admin plane only accepts mutating requests on a loopback bind.
    #[serde(default)]
    pub control_tokens: Vec<String>,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            control_tokens: Vec::new(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorKind {
    Subprocess,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "default_connector_kind")]
    pub kind: ConnectorKind,
    /// Program + args for the subprocess connector.
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Endpoint for the http connector.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_connector_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            kind: default_connector_kind(),
            program: None,
            args: Vec::new(),
            url: None,
            auth_token: None,
            timeout_seconds: default_connector_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub poll_url: String,
    #[serde(default)]
    pub write_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Mail and reminders carry a title alongside the body.
    #[serde(default)]
    pub title_bearing: bool,
}

fn default_workspace() -> String {
    "home".to_string()
}

fn default_approval_ttl_minutes() -> u64 {
    30
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    64
}

fn default_connector_kind() -> ConnectorKind {
    ConnectorKind::Subprocess
}

fn default_connector_timeout_seconds() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    2000
}

impl RelayConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (cfg, _) = Self::load_with_path(path).await?;
        Ok(cfg)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: RelayConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RELAYD_DEFAULT_WORKSPACE") {
            if !v.trim().is_empty() {
                self.general.default_workspace = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("RELAYD_STORE_PATH") {
            if !v.trim().is_empty() {
                self.store.path = Some(v);
            }
        }
        if let Ok(v) = std::env::var("RELAYD_BIND_ADDR") {
            if !v.trim().is_empty() {
                self.admin.bind_addr = v;
            }
        }
        if let Ok(v) = std::env::var("RELAYD_CONTROL_TOKEN") {
            if !v.trim().is_empty() {
                self.admin.control_tokens.push(v);
            }
        }
        if let Ok(v) = std::env::var("RELAYD_CONNECTOR_PROGRAM") {
            if !v.trim().is_empty() {
                self.connector.kind = ConnectorKind::Subprocess;
                self.connector.program = Some(v);
            }
        }
        if let Ok(v) = std::env::var("RELAYD_CONNECTOR_URL") {
            if !v.trim().is_empty() {
                self.connector.kind = ConnectorKind::Http;
                self.connector.url = Some(v);
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.default_workspace.trim().is_empty() {
            return Err(anyhow::anyhow!("general.default_workspace is required"));
        }
        if self.general.approval_ttl_minutes == 0 {
            return Err(anyhow::anyhow!("general.approval_ttl_minutes must be > 0"));
        }
        if self.general.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!(
                "general.sweep_interval_seconds must be > 0"
            ));
        }
        match self.connector.kind {
            ConnectorKind::Subprocess => {
                if self
                    .connector
                    .program
                    .as_deref()
                    .map(str::trim)
                    .unwrap_or_default()
                    .is_empty()
                {
                    return Err(anyhow::anyhow!(
                        "connector.program is required for connector.kind = \"subprocess\""
                    ));
                }
            }
            ConnectorKind::Http => {
                if self
                    .connector
                    .url
                    .as_deref()
                    .map(str::trim)
                    .unwrap_or_default()
                    .is_empty()
                {
                    return Err(anyhow::anyhow!(
                        "connector.url is required for connector.kind = \"http\""
                    ));
                }
            }
        }
        for (name, channel) in &self.channels {
            if !channel.enabled {
                continue;
            }
            if channel.poll_url.trim().is_empty() || channel.write_url.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "channels.{name}: poll_url and write_url are required when enabled"
                ));
            }
            if channel.poll_interval_ms == 0 {
                return Err(anyhow::anyhow!(
                    "channels.{name}: poll_interval_ms must be > 0"
                ));
            }
        }
        Ok(())
    }

    /// Known workspaces, default first, deduplicated case-insensitively.
    pub fn known_workspaces(&self) -> Vec<String> {
        let mut known = vec![self.general.default_workspace.clone()];
        for workspace in &self.general.workspaces {
            if !known.iter().any(|w| w.eq_ignore_ascii_case(workspace)) {
                known.push(workspace.clone());
            }
        }
        known
    }

    pub fn store_path(&self) -> anyhow::Result<PathBuf> {
        match self.store.path.as_deref() {
            Some(path) => expand_home(path),
            None => Ok(default_data_dir().join("relay.db")),
        }
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = (&String, &ChannelConfig)> {
        self.channels.iter().filter(|(_, c)| c.enabled)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".relayd").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".relayd").join("data")
}

pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen("~", &home, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> RelayConfig {
        toml::from_str(
            r#"
[connector]
kind = "subprocess"
program = "relay-backend"

[channels.messages]
enabled = true
poll_url = "http://127.0.0.1:8900/messages/poll"
write_url = "http://127.0.0.1:8900/messages/write"
"#,
        )
        .expect("parse minimal config")
    }

    #[test]
    fn minimal_config_validates_with_defaults() {
        let cfg = minimal_config();
        cfg.validate().expect("valid");
        assert_eq!(cfg.general.default_workspace, "home");
        assert_eq!(cfg.general.approval_ttl_minutes, 30);
        assert_eq!(cfg.channels["messages"].poll_interval_ms, 2000);
    }

    #[test]
    fn enabled_channel_requires_urls() {
        let mut cfg = minimal_config();
        cfg.channels.get_mut("messages").unwrap().write_url = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn http_connector_requires_url() {
        let mut cfg = minimal_config();
        cfg.connector.kind = ConnectorKind::Http;
        cfg.connector.url = None;
        assert!(cfg.validate().is_err());
        cfg.connector.url = Some("http://127.0.0.1:9000/run".to_string());
        cfg.validate().expect("valid");
    }

    #[test]
    fn known_workspaces_keeps_default_first_without_duplicates() {
        let mut cfg = minimal_config();
        cfg.general.workspaces = vec!["Home".to_string(), "work".to_string()];
        assert_eq!(
            cfg.known_workspaces(),
            vec!["home".to_string(), "work".to_string()]
        );
    }
}
