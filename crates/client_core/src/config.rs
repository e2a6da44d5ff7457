use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;
use url::Url;

pub const CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server_url: String,
    pub default_channel: String,
    pub database_url: String,
    /// Delay before the one automatic transport reconnect; 0 disables it.
    pub reconnect_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3001".into(),
            default_channel: "general".into(),
            database_url: default_database_url(),
            reconnect_delay_ms: 3000,
            request_timeout_ms: 10_000,
        }
    }
}

fn default_database_url() -> String {
    match dirs::data_local_dir() {
        Some(dir) => {
            let path = dir.join("chat_client").join("client.db");
            format!("sqlite://{}", path.to_string_lossy().replace('\\', "/"))
        }
        None => "sqlite://./data/client.db".into(),
    }
}

impl ClientConfig {
    /// The server base url, always ending in `/` so endpoint joins append.
    pub fn server_url(&self) -> anyhow::Result<Url> {
        let raw = self.server_url.trim();
        let raw = if raw.ends_with('/') {
            raw.to_string()
        } else {
            format!("{raw}/")
        };
        Url::parse(&raw).with_context(|| format!("invalid server url '{}'", self.server_url))
    }

    pub fn reconnect_delay(&self) -> Option<Duration> {
        (self.reconnect_delay_ms > 0).then(|| Duration::from_millis(self.reconnect_delay_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    server_url: Option<String>,
    default_channel: Option<String>,
    database_url: Option<String>,
    reconnect_delay_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
}

/// Defaults, then `client.toml` in the working directory, then environment.
pub fn load_config() -> ClientConfig {
    load_config_from(Path::new(CONFIG_FILE), |key| std::env::var(key).ok())
}

pub fn load_config_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> ClientConfig {
    let mut config = ClientConfig::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileConfig>(&raw) {
            Ok(file_cfg) => apply_file(&mut config, file_cfg),
            Err(err) => warn!(path = %path.display(), error = %err, "config: ignoring unreadable file"),
        }
    }

    for key in ["CHAT_SERVER_URL", "APP__SERVER_URL"] {
        if let Some(v) = env(key) {
            config.server_url = v;
        }
    }
    for key in ["CHAT_DEFAULT_CHANNEL", "APP__DEFAULT_CHANNEL"] {
        if let Some(v) = env(key).filter(|v| !v.trim().is_empty()) {
            config.default_channel = v.trim().to_string();
        }
    }
    for key in ["CHAT_DATABASE_URL", "APP__DATABASE_URL"] {
        if let Some(v) = env(key) {
            config.database_url = v;
        }
    }
    for key in ["CHAT_RECONNECT_DELAY_MS", "APP__RECONNECT_DELAY_MS"] {
        if let Some(v) = env(key) {
            match v.parse::<u64>() {
                Ok(parsed) => config.reconnect_delay_ms = parsed,
                Err(_) => warn!(key, value = %v, "config: ignoring non-numeric override"),
            }
        }
    }

    config
}

fn apply_file(config: &mut ClientConfig, file_cfg: FileConfig) {
    if let Some(v) = file_cfg.server_url {
        config.server_url = v;
    }
    if let Some(v) = file_cfg.default_channel.filter(|v| !v.trim().is_empty()) {
        config.default_channel = v.trim().to_string();
    }
    if let Some(v) = file_cfg.database_url {
        config.database_url = v;
    }
    if let Some(v) = file_cfg.reconnect_delay_ms {
        config.reconnect_delay_ms = v;
    }
    if let Some(v) = file_cfg.request_timeout_ms {
        config.request_timeout_ms = v;
    }
}
