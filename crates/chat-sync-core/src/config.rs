//! Layered configuration.
//!
//! Merge order (later overrides earlier):
//! 1. Compiled defaults
//! 2. `~/.config/chat-sync/chat-sync.toml`
//! 3. `./chat-sync.toml`
//! 4. `CHAT_SYNC_*` environment variables

#![allow(clippy::result_large_err)] // figment::Error is external

use std::{path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// WebSocket URL of the realtime channel.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Base URL of the REST API.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Root directory of the durable key layout.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Realtime channel settings.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Persistence settings.
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            api_url: default_api_url(),
            data_dir: default_data_dir(),
            channel: ChannelConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Reconnection policy for the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    /// First reconnect delay, and the delay after any successful connect.
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,

    /// Upper bound for the reconnect delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Handshake timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Consecutive failures tolerated before giving up. `None` retries forever.
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Keepalive period while connected. `None` disables pings.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: Option<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_retries: None,
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

impl ChannelConfig {
    /// Minimum reconnect delay.
    #[must_use]
    pub const fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    /// Maximum reconnect delay (never below the minimum).
    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms.max(self.backoff_min_ms))
    }

    /// Handshake timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Keepalive period; zero counts as disabled.
    #[must_use]
    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Persistence settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Window during which snapshot saves are coalesced into one write.
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            save_debounce_ms: default_save_debounce_ms(),
        }
    }
}

impl StoreConfig {
    /// Coalescing window.
    #[must_use]
    pub const fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }
}

fn default_server_url() -> String {
    "ws://127.0.0.1:5000/ws".to_string()
}

fn default_api_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chat-sync")
}

const fn default_backoff_min_ms() -> u64 {
    500
}

const fn default_backoff_max_ms() -> u64 {
    30_000
}

const fn default_connect_timeout_ms() -> u64 {
    10_000
}

#[allow(clippy::unnecessary_wraps)]
const fn default_ping_interval_ms() -> Option<u64> {
    Some(25_000)
}

const fn default_save_debounce_ms() -> u64 {
    50
}

/// Load configuration from the standard locations with env var overrides.
///
/// # Errors
/// Returns error if a present file or variable fails to deserialize.
pub fn load_config() -> Result<SyncConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(SyncConfig::default()))
        .merge(Toml::file(
            dirs::config_dir()
                .map(|d| d.join("chat-sync/chat-sync.toml"))
                .unwrap_or_default(),
        ))
        .merge(Toml::file("chat-sync.toml"))
        .merge(env_provider())
        .extract()
}

/// Load configuration from a specific file with env var overrides.
///
/// # Errors
/// Returns error if the file or a variable fails to deserialize.
pub fn load_config_from_path(path: &Path) -> Result<SyncConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(SyncConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

/// Load configuration from a TOML string only (no files, no env).
///
/// # Errors
/// Returns error if the TOML is invalid or has unknown keys.
pub fn load_config_from_str(toml_content: &str) -> Result<SyncConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(SyncConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// `CHAT_SYNC_CHANNEL_MAX_RETRIES` -> `channel.max_retries`.
///
/// Mapped by section prefix rather than split on `_`, since field names
/// contain underscores themselves.
fn env_provider() -> Env {
    Env::prefixed("CHAT_SYNC_").map(|key| {
        key.as_str()
            .replacen("channel_", "channel.", 1)
            .replacen("store_", "store.", 1)
            .into()
    })
}
