//! Application configuration.
//!
//! Loaded from a TOML file; every field has a default so a missing file or
//! a partial file is valid. Credentials and the API origin can be supplied
//! through the environment instead of the file.

use crate::error::{AppError, AppResult};
use livefeed_feed::AggregatorConfig;
use livefeed_ws::ConnectionConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Overrides `socket.api_key`.
pub const ENV_API_KEY: &str = "LIVEFEED_API_KEY";
/// Overrides `api_origin`.
pub const ENV_API_ORIGIN: &str = "LIVEFEED_API_ORIGIN";

/// WebSocket feed settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_socket_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    #[serde(default = "default_trade_event")]
    pub trade_event: String,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Symbols subscribed on the shared socket (e.g. "X:BTCUSD").
    #[serde(default)]
    pub symbols: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_socket_url() -> String {
    "wss://socket.polygon.io/crypto".to_string()
}

fn default_channel_prefix() -> String {
    "XT".to_string()
}

fn default_trade_event() -> String {
    "XT".to_string()
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_socket_url(),
            api_key: String::new(),
            channel_prefix: default_channel_prefix(),
            trade_event: default_trade_event(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            symbols: Vec::new(),
        }
    }
}

impl From<SocketConfig> for ConnectionConfig {
    fn from(cfg: SocketConfig) -> Self {
        Self {
            url: cfg.url,
            api_key: cfg.api_key,
            channel_prefix: cfg.channel_prefix,
            trade_event: cfg.trade_event,
            reconnect_base_delay_ms: cfg.reconnect_base_delay_ms,
            reconnect_max_delay_ms: cfg.reconnect_max_delay_ms,
            ..Default::default()
        }
    }
}

/// Stream-or-poll aggregator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    #[serde(default = "default_last_price_path")]
    pub last_price_path: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_symbol_prefix")]
    pub symbol_prefix: String,
    #[serde(default)]
    pub symbols: Vec<String>,
}

fn default_stream_path() -> String {
    "/api/prices/stream".to_string()
}

fn default_last_price_path() -> String {
    "/api/prices/last".to_string()
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_symbol_prefix() -> String {
    livefeed_core::DEFAULT_SYMBOL_PREFIX.to_string()
}

impl Default for AggregatorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            stream_path: default_stream_path(),
            last_price_path: default_last_price_path(),
            poll_interval_ms: default_poll_interval_ms(),
            symbol_prefix: default_symbol_prefix(),
            symbols: Vec::new(),
        }
    }
}

impl AggregatorSection {
    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            symbol_prefix: self.symbol_prefix.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

/// Single-symbol watcher settings. Disabled when `symbol` is unset.
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherSection {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default = "default_watch_interval_ms")]
    pub interval_ms: u64,
}

fn default_watch_interval_ms() -> u64 {
    2000
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            symbol: None,
            interval_ms: default_watch_interval_ms(),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Origin of the price REST and stream endpoints.
    #[serde(default = "default_api_origin")]
    pub api_origin: String,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub aggregator: AggregatorSection,
    #[serde(default)]
    pub watcher: WatcherSection,
}

fn default_api_origin() -> String {
    "http://localhost:3000".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_origin: default_api_origin(),
            socket: SocketConfig::default(),
            aggregator: AggregatorSection::default(),
            watcher: WatcherSection::default(),
        }
    }
}

impl AppConfig {
    /// Load from `path`, falling back to defaults when the file is absent,
    /// then apply environment overrides.
    pub fn load(path: &str) -> AppResult<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            info!(path, "Config file not found, using defaults");
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        toml::from_str(content).map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))
    }

    /// Apply `LIVEFEED_API_KEY` / `LIVEFEED_API_ORIGIN` from `lookup`.
    ///
    /// Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = non_blank(ENV_API_KEY) {
            self.socket.api_key = key;
        }
        if let Some(origin) = non_blank(ENV_API_ORIGIN) {
            self.api_origin = origin;
        }
    }

    /// Socket feed should run.
    pub fn socket_active(&self) -> bool {
        self.socket.enabled && !self.socket.symbols.is_empty()
    }

    /// Aggregator should run.
    pub fn aggregator_active(&self) -> bool {
        self.aggregator.enabled && !self.aggregator.symbols.is_empty()
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watcher.interval_ms)
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> AppResult<()> {
        if self.socket_active() && self.socket.api_key.trim().is_empty() {
            return Err(AppError::Config(format!(
                "socket.api_key is empty (set it in the file or via {ENV_API_KEY})"
            )));
        }
        if self.socket.reconnect_base_delay_ms == 0
            || self.socket.reconnect_max_delay_ms < self.socket.reconnect_base_delay_ms
        {
            return Err(AppError::Config(
                "socket reconnect delays must satisfy 0 < base <= max".to_string(),
            ));
        }
        if self.aggregator.poll_interval_ms == 0 || self.watcher.interval_ms == 0 {
            return Err(AppError::Config("poll intervals must be positive".to_string()));
        }
        Ok(())
    }
}
