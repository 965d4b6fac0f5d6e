use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

const DEFAULT_SETTINGS_FILE: &str = "realtime.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub broker_url: String,
    pub subscription_path: String,
    pub topic_prefix: String,
    pub subscription_id: String,
    pub protocol_version: String,
    pub reconnect_delay_ms: u64,
    pub workspace_poll_ms: u64,
    pub auth_close_code: u16,
    pub payload_buffer: usize,
    pub page_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker_url: "ws://127.0.0.1:8080".into(),
            subscription_path: "/ws".into(),
            topic_prefix: "/topic/conversations/".into(),
            subscription_id: "sub-0".into(),
            protocol_version: "1.2".into(),
            reconnect_delay_ms: 10_000,
            workspace_poll_ms: 1_000,
            auth_close_code: 4001,
            payload_buffer: 256,
            page_size: 20,
        }
    }
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid broker url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("broker url must use ws://, wss://, http:// or https://, got {0}://")]
    UnsupportedScheme(String),
}

impl Settings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn workspace_poll_interval(&self) -> Duration {
        Duration::from_millis(self.workspace_poll_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.page_size > 0, "page_size must be greater than zero");
        anyhow::ensure!(
            self.payload_buffer > 0,
            "payload_buffer must be greater than zero"
        );
        Ok(())
    }

    /// Broker base joined with the subscription path. `http(s)` bases are
    /// mapped to `ws(s)`.
    pub fn endpoint(&self) -> Result<Url, EndpointError> {
        let mut url = Url::parse(self.broker_url.trim())?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
        };
        if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
            return Err(EndpointError::UnsupportedScheme(url.scheme().to_string()));
        }

        let base = url.path().trim_end_matches('/').to_string();
        let suffix = self.subscription_path.trim();
        let path = if suffix.is_empty() {
            base
        } else if suffix.starts_with('/') {
            format!("{base}{suffix}")
        } else {
            format!("{base}/{suffix}")
        };
        url.set_path(&path);
        Ok(url)
    }
}

/// Defaults, then `path` (or `./realtime.toml` when present), then `APP__*`
/// environment overrides.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let file = match path {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let default = PathBuf::from(DEFAULT_SETTINGS_FILE);
            default.exists().then_some(default)
        }
    };

    let mut settings = match file {
        Some(file) => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("failed to read settings file '{}'", file.display()))?;
            toml::from_str::<Settings>(&raw)
                .with_context(|| format!("failed to parse settings file '{}'", file.display()))?
        }
        None => Settings::default(),
    };

    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("APP__BROKER_URL") {
        settings.broker_url = v;
    }
    if let Some(v) = lookup("APP__SUBSCRIPTION_PATH") {
        settings.subscription_path = v;
    }
    if let Some(v) = lookup("APP__TOPIC_PREFIX") {
        settings.topic_prefix = v;
    }
    if let Some(v) = lookup("APP__SUBSCRIPTION_ID") {
        settings.subscription_id = v;
    }

    if let Some(v) = lookup("APP__RECONNECT_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_delay_ms = parsed;
        }
    }
    if let Some(v) = lookup("APP__WORKSPACE_POLL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.workspace_poll_ms = parsed;
        }
    }
    if let Some(v) = lookup("APP__AUTH_CLOSE_CODE") {
        if let Ok(parsed) = v.parse::<u16>() {
            settings.auth_close_code = parsed;
        }
    }
    if let Some(v) = lookup("APP__PAYLOAD_BUFFER") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.payload_buffer = parsed;
        }
    }
    if let Some(v) = lookup("APP__PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.page_size = parsed;
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
