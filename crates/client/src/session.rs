//! Pure session state machine
//!
//! Connection lifecycle and store updates for one chat session live here as
//! plain synchronous methods on [`Session`]. No IO, no async, no locking; the
//! async driver in `manager.rs` feeds it transport outcomes and inbound frames.

use megatrade_protocol::{ClientMessage, Message, OperatorIdentity, Participant, ServerMessage};

use crate::error::SessionError;
use crate::store::{HistoryStore, RosterStore};

// ---------------------------------------------------------------------------
// SessionPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Active,
    Closed,
}

// ---------------------------------------------------------------------------
// InboundEvent: one variant per server event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Roster(Vec<Participant>),
    History(Vec<Message>),
    Message(Message),
    Error { code: String, message: String },
}

impl From<ServerMessage> for InboundEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::RosterUpdated(participants) => InboundEvent::Roster(participants),
            ServerMessage::HistorySnapshot(messages) => InboundEvent::History(messages),
            ServerMessage::MessageReceived(message) => InboundEvent::Message(message),
            ServerMessage::Error { code, message } => InboundEvent::Error { code, message },
        }
    }
}

/// What `dispatch` did with an inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    RosterReplaced,
    HistoryReplaced,
    MessageAppended,
    RelayError { code: String, message: String },
    /// The session was not active; nothing changed.
    Discarded,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Session {
    identity: OperatorIdentity,
    phase: SessionPhase,
    roster: RosterStore,
    history: HistoryStore,
    joins_sent: u32,
}

impl Session {
    /// A session starts `Idle` with an already-resolved identity.
    pub fn new(identity: OperatorIdentity) -> Self {
        Self {
            identity,
            phase: SessionPhase::Idle,
            roster: RosterStore::new(),
            history: HistoryStore::new(),
            joins_sent: 0,
        }
    }

    pub fn identity(&self) -> &OperatorIdentity {
        &self.identity
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn roster(&self) -> &RosterStore {
        &self.roster
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Number of presence announcements produced so far (one per connection).
    pub fn joins_sent(&self) -> u32 {
        self.joins_sent
    }

    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }

    /// `Idle → Connecting`. Only valid once per session.
    pub fn begin_connect(&mut self) -> Result<(), SessionError> {
        self.transition(SessionPhase::Idle, SessionPhase::Connecting)
    }

    /// `Connecting → Active`. Returns the presence announcement that must be
    /// sent before anything else on the new connection.
    pub fn connection_opened(&mut self) -> Result<ClientMessage, SessionError> {
        self.transition(SessionPhase::Connecting, SessionPhase::Active)?;
        self.joins_sent += 1;
        Ok(ClientMessage::PresenceJoin(self.identity.clone()))
    }

    /// `Active → Connecting` after the transport dropped. Stores keep their
    /// contents until the relay re-sends roster and history.
    pub fn connection_lost(&mut self) -> Result<(), SessionError> {
        self.transition(SessionPhase::Active, SessionPhase::Connecting)
    }

    /// Move to `Closed` from any phase. Returns `false` if already closed.
    pub fn close(&mut self) -> bool {
        if self.phase == SessionPhase::Closed {
            return false;
        }
        self.phase = SessionPhase::Closed;
        true
    }

    /// Apply one inbound event. Events are only honored while `Active`.
    pub fn dispatch(&mut self, event: InboundEvent) -> Applied {
        if self.phase != SessionPhase::Active {
            return Applied::Discarded;
        }

        match event {
            InboundEvent::Roster(participants) => {
                self.roster.replace(participants);
                Applied::RosterReplaced
            }
            InboundEvent::History(messages) => {
                self.history.replace(messages);
                Applied::HistoryReplaced
            }
            InboundEvent::Message(message) => {
                self.history.append(message);
                Applied::MessageAppended
            }
            InboundEvent::Error { code, message } => Applied::RelayError { code, message },
        }
    }

    fn transition(&mut self, from: SessionPhase, to: SessionPhase) -> Result<(), SessionError> {
        if self.phase != from {
            return Err(SessionError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
