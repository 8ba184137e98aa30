//! Error taxonomy for chat sessions.

use std::path::PathBuf;

use thiserror::Error;

use crate::session::SessionPhase;

/// Identity resolution failed. The message is meant to be shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FetchError {
    pub message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Transport-level failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Connection lost: {0}")]
    Lost(String),

    #[error("Failed to send {event}: {reason}")]
    Send { event: &'static str, reason: String },

    #[error("Gave up after {attempts} reconnect attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Errors surfaced by a chat session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Identity resolution failed: {0}")]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Invalid session transition from {from:?} to {to:?}")]
    InvalidTransition { from: SessionPhase, to: SessionPhase },

    #[error("Session is not connected")]
    NotConnected,

    #[error("Session closed")]
    Closed,
}

/// Errors loading client configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Unsupported server URL {url}: {reason}")]
    ServerUrl { url: String, reason: &'static str },
}
