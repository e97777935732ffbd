//! Configuration for the messaging core.
//!
//! Values come from (lowest to highest precedence) built-in defaults, an
//! optional `incident-chat.{toml,yaml,json}` file and `INCIDENT_CHAT__*`
//! environment variables. Durations are configured in milliseconds.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use url::Url;

use crate::error::{ChatError, Result};

const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api/messaging";
const DEFAULT_WS_BASE_URL: &str = "ws://localhost:8000/api/messaging";
const ENV_PREFIX: &str = "INCIDENT_CHAT";
const DEFAULT_CONFIG_NAME: &str = "incident-chat";

/// Runtime configuration shared by every channel and session.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Base URL of the messaging REST API (`…/api/messaging`).
    pub api_base_url: Url,
    /// Base URL of the messaging socket endpoints (`ws(s)://…/api/messaging`).
    pub ws_base_url: Url,
    /// Fixed delay before reconnecting a dropped live channel.
    pub reconnect_delay: Duration,
    /// Give up after this many consecutive failed reconnects (`None` = never).
    pub max_reconnect_attempts: Option<u32>,
    /// Connect attempts slower than this count as failures.
    pub connect_timeout: Duration,
    /// Keepalive ping period while a channel is open.
    pub ping_interval: Duration,
    /// Fallback re-fetch period while a channel is not open.
    pub poll_interval: Duration,
    /// Per-request timeout for REST calls.
    pub request_timeout: Duration,
    /// Capacity of the broadcast channels feeding subscribers.
    pub event_buffer: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base_url: Url::parse(DEFAULT_API_BASE_URL).expect("default API URL is valid"),
            ws_base_url: Url::parse(DEFAULT_WS_BASE_URL).expect("default WS URL is valid"),
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_attempts: None,
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            event_buffer: 256,
        }
    }
}

/// Raw settings as they appear in files and the environment.
#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default = "default_api_base_url")]
    api_base_url: String,
    #[serde(default = "default_ws_base_url")]
    ws_base_url: String,
    #[serde(default = "default_reconnect_delay_ms")]
    reconnect_delay_ms: u64,
    #[serde(default)]
    max_reconnect_attempts: Option<u32>,
    #[serde(default = "default_connect_timeout_ms")]
    connect_timeout_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    ping_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    request_timeout_ms: u64,
    #[serde(default = "default_event_buffer")]
    event_buffer: usize,
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_ws_base_url() -> String {
    DEFAULT_WS_BASE_URL.to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    3_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    256
}

impl ChatConfig {
    /// Load from `incident-chat.*` in the working directory (if present) and
    /// the process environment.
    pub fn load() -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(DEFAULT_CONFIG_NAME).required(false))
            .add_source(env_source());
        Self::from_config(builder.build()?)
    }

    /// Load from an explicit file plus the process environment.
    pub fn load_from(path: &Path) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::from(path))
            .add_source(env_source());
        Self::from_config(builder.build()?)
    }

    fn from_config(config: Config) -> Result<Self> {
        let raw: RawSettings = config.try_deserialize()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self> {
        let api_base_url = Url::parse(&raw.api_base_url)?;
        if !matches!(api_base_url.scheme(), "http" | "https") {
            return Err(ChatError::Config(format!(
                "api_base_url must use http:// or https://, got: {}",
                api_base_url.scheme()
            )));
        }

        let ws_base_url = Url::parse(&raw.ws_base_url)?;
        if !matches!(ws_base_url.scheme(), "ws" | "wss") {
            return Err(ChatError::Config(format!(
                "ws_base_url must use ws:// or wss://, got: {}",
                ws_base_url.scheme()
            )));
        }

        if raw.poll_interval_ms == 0 || raw.ping_interval_ms == 0 {
            return Err(ChatError::Config(
                "poll and ping intervals must be non-zero".to_string(),
            ));
        }

        Ok(Self {
            api_base_url,
            ws_base_url,
            reconnect_delay: Duration::from_millis(raw.reconnect_delay_ms),
            max_reconnect_attempts: raw.max_reconnect_attempts,
            connect_timeout: Duration::from_millis(raw.connect_timeout_ms),
            ping_interval: Duration::from_millis(raw.ping_interval_ms),
            poll_interval: Duration::from_millis(raw.poll_interval_ms),
            request_timeout: Duration::from_millis(raw.request_timeout_ms),
            event_buffer: raw.event_buffer.max(1),
        })
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}
