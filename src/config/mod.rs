//! Configuration management for rendezvous-core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// ICE server entry handed to the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (`stun:`, `turn:` or `turns:`)
    pub urls: Vec<String>,

    /// TURN username
    #[serde(default)]
    pub username: Option<String>,

    /// TURN credential
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relay connection configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Negotiation session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// ICE servers used for every peer connection
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Signaling relay address (ws:// or wss://)
    #[serde(default = "default_relay_address")]
    pub address: String,

    /// Maximum connection attempts before giving up
    #[serde(default = "default_reconnects")]
    pub reconnects: u32,

    /// Delay before reconnecting after a relay error
    #[serde(default = "default_backoff_on_error_ms")]
    pub backoff_on_error_ms: u64,

    /// Delay before reconnecting after the relay closed
    #[serde(default = "default_backoff_on_close_ms")]
    pub backoff_on_close_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Peer id advertised to the relay; random when unset
    #[serde(default)]
    pub peer_id: Option<String>,

    /// Withhold local ICE candidates until gathering completes
    #[serde(default)]
    pub stop_local_ice: bool,

    /// Label of the data channel opened with every peer connection
    #[serde(default = "default_data_channel_label")]
    pub data_channel_label: String,

    /// Upper bound for a single negotiation step in ms (0 = unbounded)
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,

    /// Request stereo Opus in every local description
    #[serde(default)]
    pub opus_stereo: bool,
}

impl SessionConfig {
    pub fn negotiation_timeout(&self) -> Option<Duration> {
        if self.negotiation_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.negotiation_timeout_ms))
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            address: default_relay_address(),
            reconnects: default_reconnects(),
            backoff_on_error_ms: default_backoff_on_error_ms(),
            backoff_on_close_ms: default_backoff_on_close_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer_id: None,
            stop_local_ice: false,
            data_channel_label: default_data_channel_label(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            opus_stereo: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            session: SessionConfig::default(),
            ice_servers: default_ice_servers(),
        }
    }
}

/// Retry bounds applied by the reconnection supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff_on_error: Duration,
    pub backoff_on_close: Duration,
}

impl From<&RelayConfig> for ReconnectPolicy {
    fn from(relay: &RelayConfig) -> Self {
        Self {
            max_attempts: relay.reconnects,
            backoff_on_error: Duration::from_millis(relay.backoff_on_error_ms),
            backoff_on_close: Duration::from_millis(relay.backoff_on_close_ms),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from(&self.relay)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let address = self.relay.address.trim();
        if !address.starts_with("ws://") && !address.starts_with("wss://") {
            return Err(format!("Relay address must use ws:// or wss://: {}", address).into());
        }

        if self.session.data_channel_label.is_empty() {
            return Err("Data channel label must not be empty".into());
        }

        if let Some(ref peer_id) = self.session.peer_id {
            if peer_id.trim().is_empty() || peer_id.contains(char::is_whitespace) {
                return Err("Peer id must be a single non-empty token".into());
            }
        }

        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err("ICE server entry has no urls".into());
            }
            for url in &server.urls {
                if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:")) {
                    return Err(format!("Unsupported ICE server url: {}", url).into());
                }
                if url.starts_with("turn") && (server.username.is_none() || server.credential.is_none()) {
                    return Err(format!("TURN server {} requires username and credential", url).into());
                }
            }
        }

        Ok(())
    }
}

fn default_relay_address() -> String {
    "ws://127.0.0.1:8443".to_string()
}

fn default_reconnects() -> u32 { 10 }
fn default_backoff_on_error_ms() -> u64 { 3000 }
fn default_backoff_on_close_ms() -> u64 { 1000 }
fn default_negotiation_timeout_ms() -> u64 { 30_000 }

fn default_data_channel_label() -> String {
    "ch0".to_string()
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.services.mozilla.com"),
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
    ]
}
