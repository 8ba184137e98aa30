//! Roster and history containers.
//!
//! Neither store evicts, bounds or deduplicates. The roster is only ever
//! replaced as a whole; the history is replaced by a snapshot and otherwise
//! grows by appending in arrival order.

use megatrade_protocol::{Message, Participant};

/// Participants currently present in the room
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterStore {
    participants: Vec<Participant>,
}

impl RosterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster with `participants`, discarding the previous set.
    pub fn replace(&mut self, participants: Vec<Participant>) {
        self.participants = participants;
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participants.iter().any(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

/// Ordered chat history, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryStore {
    messages: Vec<Message>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole history with a snapshot from the relay.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Append one message at the end. Amortized O(1).
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
