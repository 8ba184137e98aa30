//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    /// Full roster of the room; replaces whatever the client held
    #[serde(rename = "roster.updated")]
    RosterUpdated(Vec<Participant>),

    /// Prior messages of the room, oldest first
    #[serde(rename = "history.snapshot")]
    HistorySnapshot(Vec<Message>),

    /// A single new message
    #[serde(rename = "message.received")]
    MessageReceived(Message),

    // Errors
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerMessage {
    /// Wire name of the event
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::RosterUpdated(_) => "roster.updated",
            ServerMessage::HistorySnapshot(_) => "history.snapshot",
            ServerMessage::MessageReceived(_) => "message.received",
            ServerMessage::Error { .. } => "error",
        }
    }
}
