//! Client settings, loaded from `client.toml` in the data dir.
//!
//! Missing file or missing keys fall back to defaults; command-line flags
//! are applied on top by the caller.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use megatrade_protocol::DEFAULT_ROOM;

use crate::error::ConfigError;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:4000";
pub const DEFAULT_ACCOUNT_API: &str = "http://127.0.0.1:5000/api";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub account_api: String,
    pub room: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            account_api: DEFAULT_ACCOUNT_API.to_string(),
            room: DEFAULT_ROOM.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Read `path`, or return defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings the transport cannot honour. The WebSocket client is
    /// built without TLS, so only `ws://` relays are reachable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.server_url.trim();
        let reason = if url.starts_with("wss://") {
            "TLS (wss://) is not supported by this client"
        } else if !url.starts_with("ws://") {
            "expected a ws:// URL"
        } else {
            return Ok(());
        };

        Err(ConfigError::ServerUrl {
            url: self.server_url.clone(),
            reason,
        })
    }

    /// WebSocket URL of the configured room
    pub fn room_url(&self) -> String {
        format!(
            "{}/chat/{}",
            self.server_url.trim_end_matches('/'),
            urlencoding::encode(&self.room)
        )
    }
}

/// Bounded exponential backoff for reconnects.
///
/// `max_attempts = 0` disables reconnecting: the first transport failure
/// closes the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}
