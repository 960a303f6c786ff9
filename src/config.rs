use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Settings for the call manager and signaling relay.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Upper bound on relayed ICE candidates per session, both sides combined.
    pub max_ice_candidates: usize,
    /// How many pending calls `get_incoming_calls` returns at most.
    pub incoming_calls_limit: usize,
    /// Buffer size of the lifecycle event broadcast channel.
    pub event_capacity: usize,
    /// End calls that stay unanswered this long. `None` keeps them until a
    /// participant acts.
    pub unanswered_timeout_secs: Option<u64>,
    /// How often the reaper scans for unanswered calls.
    pub reaper_interval_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            max_ice_candidates: 200,
            incoming_calls_limit: 5,
            event_capacity: 100,
            unanswered_timeout_secs: None,
            reaper_interval_secs: 5,
        }
    }
}

impl CallConfig {
    pub fn unanswered_timeout(&self) -> Option<Duration> {
        self.unanswered_timeout_secs.map(Duration::from_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }
}

/// A STUN/TURN server handed to the peer connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Settings for an endpoint's negotiation client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub ice_servers: Vec<IceServer>,
    pub audio: bool,
    pub video: bool,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            audio: true,
            video: true,
        }
    }
}

/// Top-level configuration file layout.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub calls: CallConfig,
    pub negotiation: NegotiationConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl AppConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw)
    }
}
