//! Relay state: one [`Room`] per room name.
//!
//! Rooms exist while at least one connection holds them; the last connection
//! to release a room drops it together with its history.
//!
//! A room keeps the members joined through each connection, an in-memory
//! history and a broadcast channel. Every mutation and the broadcast it causes
//! happen under the room lock, so all subscribers observe the same order.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use megatrade_protocol::{now_timestamp, Message, OperatorIdentity, Participant, ServerMessage};

const ROOM_BROADCAST_CAPACITY: usize = 256;
pub const MAX_BODY_CHARS: usize = 4_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("Join the room before sending messages")]
    NotJoined,

    #[error("Message body is empty")]
    EmptyMessage,

    #[error("Message body exceeds {MAX_BODY_CHARS} characters")]
    MessageTooLong,
}

impl RoomError {
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::NotJoined => "not_joined",
            RoomError::EmptyMessage => "empty_message",
            RoomError::MessageTooLong => "message_too_long",
        }
    }
}

/// Shared relay state
pub struct RoomRegistry {
    rooms: DashMap<String, Arc<Room>>,
    history_limit: Option<usize>,
}

impl RoomRegistry {
    /// `history_limit` caps each room's history; `None` keeps everything.
    pub fn new(history_limit: Option<usize>) -> Self {
        Self {
            rooms: DashMap::new(),
            history_limit,
        }
    }

    /// Get or create a room. The caller holds the room until it hands it back
    /// through [`RoomRegistry::release`].
    pub fn room(&self, name: &str) -> Arc<Room> {
        self.rooms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Room::new(name.to_string(), self.history_limit)))
            .clone()
    }

    /// Give back a room obtained from [`RoomRegistry::room`]. Once no
    /// connection holds it, the room and its history are dropped. Returns
    /// `true` if the room was evicted.
    pub fn release(&self, room: Arc<Room>) -> bool {
        let name = room.name.clone();
        drop(room);
        // `room()` clones under the same shard lock, so a count of 1 means
        // only the registry is left.
        self.rooms
            .remove_if(&name, |_, held| Arc::strong_count(held) == 1)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

struct Member {
    connection_id: u64,
    participant: Participant,
}

struct RoomInner {
    members: Vec<Member>,
    history: VecDeque<Message>,
}

/// What a connection receives when it joins
pub struct Joined {
    pub history: Vec<Message>,
    /// Room events from the roster broadcast of this join onwards
    pub rx: broadcast::Receiver<ServerMessage>,
}

pub struct Room {
    name: String,
    history_limit: Option<usize>,
    inner: Mutex<RoomInner>,
    tx: broadcast::Sender<ServerMessage>,
}

impl Room {
    fn new(name: String, history_limit: Option<usize>) -> Self {
        let (tx, _) = broadcast::channel(ROOM_BROADCAST_CAPACITY);
        Self {
            name,
            history_limit,
            inner: Mutex::new(RoomInner {
                members: Vec::new(),
                history: VecDeque::new(),
            }),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `identity` for `connection_id` (replacing a previous join on
    /// the same connection) and broadcast the new roster.
    pub async fn join(&self, connection_id: u64, identity: &OperatorIdentity) -> Joined {
        let mut inner = self.inner.lock().await;
        let participant = identity.to_participant();

        match inner
            .members
            .iter_mut()
            .find(|m| m.connection_id == connection_id)
        {
            Some(member) => member.participant = participant,
            None => inner.members.push(Member {
                connection_id,
                participant,
            }),
        }

        let rx = self.tx.subscribe();
        let _ = self.tx.send(ServerMessage::RosterUpdated(roster_of(&inner)));

        Joined {
            history: inner.history.iter().cloned().collect(),
            rx,
        }
    }

    /// Drop the member joined through `connection_id`. Returns `false` if the
    /// connection never joined.
    pub async fn leave(&self, connection_id: u64) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.members.len();
        inner.members.retain(|m| m.connection_id != connection_id);
        if inner.members.len() == before {
            return false;
        }

        let _ = self.tx.send(ServerMessage::RosterUpdated(roster_of(&inner)));
        true
    }

    /// Stamp `body` with the sender's identity, append it and broadcast it.
    pub async fn post(&self, connection_id: u64, body: &str) -> Result<Message, RoomError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(RoomError::EmptyMessage);
        }
        if body.chars().count() > MAX_BODY_CHARS {
            return Err(RoomError::MessageTooLong);
        }

        let mut inner = self.inner.lock().await;
        let sender = inner
            .members
            .iter()
            .find(|m| m.connection_id == connection_id)
            .map(|m| m.participant.clone())
            .ok_or(RoomError::NotJoined)?;

        let message = Message {
            sender_id: sender.id,
            sender_name: sender.display_name,
            body: body.to_string(),
            timestamp: now_timestamp(),
        };

        inner.history.push_back(message.clone());
        if let Some(limit) = self.history_limit {
            while inner.history.len() > limit {
                inner.history.pop_front();
            }
        }

        let _ = self.tx.send(ServerMessage::MessageReceived(message.clone()));
        Ok(message)
    }

    pub async fn history(&self) -> Vec<Message> {
        self.inner.lock().await.history.iter().cloned().collect()
    }

    pub async fn roster(&self) -> Vec<Participant> {
        roster_of(&*self.inner.lock().await)
    }
}

/// Participants in join order, one entry per operator id.
fn roster_of(inner: &RoomInner) -> Vec<Participant> {
    let mut roster: Vec<Participant> = Vec::with_capacity(inner.members.len());
    for member in &inner.members {
        if !roster.iter().any(|p| p.id == member.participant.id) {
            roster.push(member.participant.clone());
        }
    }
    roster
}
