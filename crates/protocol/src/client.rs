//! Client → Server messages

use serde::{Deserialize, Serialize};

use crate::types::OperatorIdentity;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    /// Presence announcement, sent once per connection right after it opens
    #[serde(rename = "presence.join")]
    PresenceJoin(OperatorIdentity),

    /// Compose a message; the relay stamps sender and timestamp
    #[serde(rename = "message.send")]
    SendMessage { body: String },

    /// Ask for a fresh `history.snapshot`
    #[serde(rename = "history.request")]
    RequestHistory,
}

impl ClientMessage {
    /// Wire name of the event
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::PresenceJoin(_) => "presence.join",
            ClientMessage::SendMessage { .. } => "message.send",
            ClientMessage::RequestHistory => "history.request",
        }
    }
}
