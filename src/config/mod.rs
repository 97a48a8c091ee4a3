use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::eventsub::{Exponential, Immediate, ReconnectPolicy};

/// Complete bridge configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub authdb: AuthDbConfig,
    #[serde(default)]
    pub twitch: TwitchConfig,
    #[serde(default)]
    pub eventsub: EventSubConfig,
    /// Subscriptions registered on the EventSub connection at startup
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Credential database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthDbConfig {
    #[serde(default = "default_db_path")]
    pub db: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("authdb.sqlite3")
}

impl Default for AuthDbConfig {
    fn default() -> Self {
        Self {
            db: default_db_path(),
        }
    }
}

/// OAuth application and Helix API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TwitchConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// User whose credentials authenticate the EventSub subscriptions
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

fn default_redirect_uri() -> String {
    "http://localhost:3000/oauth/callback".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["channel:read:redemptions".to_string()]
}

fn default_authorize_url() -> String {
    "https://id.twitch.tv/oauth2/authorize".to_string()
}

fn default_token_url() -> String {
    "https://id.twitch.tv/oauth2/token".to_string()
}

fn default_api_base_url() -> String {
    "https://api.twitch.tv/helix".to_string()
}

impl Default for TwitchConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            user_id: None,
            redirect_uri: default_redirect_uri(),
            scopes: default_scopes(),
            authorize_url: default_authorize_url(),
            token_url: default_token_url(),
            api_base_url: default_api_base_url(),
        }
    }
}

/// EventSub websocket configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EventSubConfig {
    #[serde(default = "default_eventsub_url")]
    pub url: String,
    /// Upper bound on a single connect attempt (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_eventsub_url() -> String {
    "wss://eventsub.wss.twitch.tv/ws".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for EventSubConfig {
    fn default() -> Self {
        Self {
            url: default_eventsub_url(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Delay applied between connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectStrategy {
    Immediate,
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_strategy")]
    pub strategy: ReconnectStrategy,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter as a fraction of the current delay (0.0 disables it)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

/// Configured deployments back off by default; `EventSubConnection` on its
/// own still reconnects immediately.
fn default_strategy() -> ReconnectStrategy {
    ReconnectStrategy::Exponential
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    120_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl ReconnectConfig {
    /// Build the reconnect policy described by this section.
    pub fn build(&self) -> Box<dyn ReconnectPolicy> {
        match self.strategy {
            ReconnectStrategy::Immediate => Box::new(Immediate),
            ReconnectStrategy::Exponential => Box::new(Exponential::new(
                std::time::Duration::from_millis(self.initial_delay_ms),
                std::time::Duration::from_millis(self.max_delay_ms),
                self.multiplier,
                self.jitter,
            )),
        }
    }
}

/// One `[[subscriptions]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    #[serde(default)]
    pub condition: serde_json::Value,
}

impl BridgeConfig {
    /// Overlay environment variables on top of file/default values.
    pub fn with_env(mut self) -> Self {
        if let Ok(v) = std::env::var("EVENTSUB_AUTHDB") {
            self.authdb.db = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TWITCH_CLIENT_ID") {
            self.twitch.client_id = v;
        }
        if let Ok(v) = std::env::var("TWITCH_CLIENT_SECRET") {
            self.twitch.client_secret = v;
        }
        if let Ok(v) = std::env::var("TWITCH_USER_ID") {
            if !v.is_empty() {
                self.twitch.user_id = Some(v);
            }
        }
        if let Ok(v) = std::env::var("EVENTSUB_URL") {
            self.eventsub.url = v;
        }
        self
    }

    /// Defaults plus environment, for running without a config file.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<BridgeConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&contents)
}

/// Parse configuration from a TOML string
pub fn parse_config(contents: &str) -> Result<BridgeConfig> {
    toml::from_str(contents).context("Failed to parse config")
}
