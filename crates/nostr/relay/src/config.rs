//! Relay configuration.
//!
//! Defaults come from the environment (`NOSTR_RELAY_PORT`, `NOSTR_RELAY_URL`,
//! `NOSTR_RELAY_MAX_MESSAGE_SIZE`); a TOML file may override any field.

use crate::error::{RelayError, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

pub const DEFAULT_PORT: u16 = 7000;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512 * 1024;
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 20;
pub const DEFAULT_MAX_FILTERS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Bind address for the WebSocket server
    pub bind_addr: SocketAddr,
    /// Maximum message size in bytes
    pub max_message_size: usize,
    /// Maximum open subscriptions per connection
    pub max_subscriptions: usize,
    /// Maximum filters in one REQ
    pub max_filters: usize,
    /// Public URL of this relay
    pub relay_url: String,
    pub info: InfoConfig,
}

/// Operator-supplied fields of the information document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InfoConfig {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pubkey: Option<String>,
    pub contact: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let port = std::env::var("NOSTR_RELAY_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let relay_url = std::env::var("NOSTR_RELAY_URL")
            .unwrap_or_else(|_| format!("ws://localhost:{}", port));

        let max_message_size = std::env::var("NOSTR_RELAY_MAX_MESSAGE_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE);

        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            max_message_size,
            max_subscriptions: DEFAULT_MAX_SUBSCRIPTIONS,
            max_filters: DEFAULT_MAX_FILTERS,
            relay_url,
            info: InfoConfig::default(),
        }
    }
}

/// On-disk form; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    bind_addr: Option<SocketAddr>,
    max_message_size: Option<usize>,
    max_subscriptions: Option<usize>,
    max_filters: Option<usize>,
    relay_url: Option<String>,
    info: Option<InfoConfig>,
}

impl RelayConfig {
    /// Environment defaults overridden by the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|e| RelayError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Environment defaults overridden by `text`.
    pub fn from_toml(text: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| RelayError::Config(e.to_string()))?;
        let mut config = Self::default();

        if let Some(bind_addr) = file.bind_addr {
            config.bind_addr = bind_addr;
        }
        if let Some(max_message_size) = file.max_message_size {
            config.max_message_size = max_message_size;
        }
        if let Some(max_subscriptions) = file.max_subscriptions {
            config.max_subscriptions = max_subscriptions;
        }
        if let Some(max_filters) = file.max_filters {
            config.max_filters = max_filters;
        }
        if let Some(relay_url) = file.relay_url {
            config.relay_url = relay_url;
        }
        if let Some(info) = file.info {
            config.info = info;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_message_size == 0 {
            return Err(RelayError::Config(
                "max_message_size must be greater than zero".to_string(),
            ));
        }
        if self.max_subscriptions == 0 {
            return Err(RelayError::Config(
                "max_subscriptions must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
