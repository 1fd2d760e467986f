//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `GWLINK_TOKEN`, `GWLINK_WS_HOST`,
//!    `GWLINK_CAFILE_PATH`
//! 2. **Config file**: path via `--config <path>`, or `gwlink.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! ```toml
//! [api]
//! ws_host = "wss://ws.gateway.example.com"
//! token = "your-access-token"
//! token_type = "Bearer"
//! ca_file = "~/certs/gateway-ca.pem"   # optional extra root CA
//!
//! [session]
//! ping_interval_secs = 30
//! ping_timeout_secs = 30
//! connect_timeout_secs = 10
//! connect_attempts = 4
//! connect_retry_delay_ms = 2000
//!
//! [tunnel]
//! host = "localhost"
//! port = 3333
//!
//! [logging]
//! level = "warn"
//! ```

use serde::Deserialize;
use std::path::Path;

const DEFAULT_CONFIG_FILE: &str = "gwlink.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Gateway API endpoint and credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// WebSocket base URL, without path.
    #[serde(default = "default_ws_host")]
    pub ws_host: String,
    /// Access token sent in the `authorization` header.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// PEM file with an extra root CA. `~` is expanded.
    #[serde(default)]
    pub ca_file: Option<String>,
}

/// Heartbeat and connect tuning for job sessions and tunnel sockets.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Total attempts when the API answers 429/503 (default 4).
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_retry_delay")]
    pub connect_retry_delay_ms: u64,
}

/// Local listener for `gdbserver`.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// `*` binds all interfaces.
    #[serde(default = "default_tunnel_host")]
    pub host: String,
    #[serde(default = "default_tunnel_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_ws_host() -> String {
    "wss://ws.gateway.example.com".to_string()
}
fn default_token_type() -> String {
    "Bearer".to_string()
}
fn default_ping_interval() -> u64 {
    30
}
fn default_ping_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_connect_attempts() -> u32 {
    4
}
fn default_connect_retry_delay() -> u64 {
    2000
}
fn default_tunnel_host() -> String {
    "localhost".to_string()
}
fn default_tunnel_port() -> u16 {
    3333
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            ws_host: default_ws_host(),
            token: String::new(),
            token_type: default_token_type(),
            ca_file: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            connect_attempts: default_connect_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            host: default_tunnel_host(),
            port: default_tunnel_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `gwlink.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Config::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(token) = var("GWLINK_TOKEN") {
            self.api.token = token;
        }
        if let Some(host) = var("GWLINK_WS_HOST") {
            self.api.ws_host = host;
        }
        if let Some(ca_file) = var("GWLINK_CAFILE_PATH") {
            self.api.ca_file = Some(ca_file);
        }
    }
}
