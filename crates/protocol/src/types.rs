//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// Role a participant holds in a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Operator,
    Member,
}

/// Identity an operator announces when joining a room.
///
/// Built once per session from the account service response and never
/// changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorIdentity {
    pub id: String,
    pub is_operator: bool,
    pub avatar_url: String,
    pub display_name: String,
}

impl OperatorIdentity {
    pub fn role(&self) -> Role {
        if self.is_operator {
            Role::Operator
        } else {
            Role::Member
        }
    }

    /// Roster entry for this identity
    pub fn to_participant(&self) -> Participant {
        Participant {
            id: self.id.clone(),
            avatar_url: self.avatar_url.clone(),
            display_name: self.display_name.clone(),
            role: self.role(),
        }
    }
}

/// A participant currently present in a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub avatar_url: String,
    pub display_name: String,
    pub role: Role,
}

/// A chat message in a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub sender_id: String,
    pub sender_name: String,
    pub body: String,
    pub timestamp: String,
}
