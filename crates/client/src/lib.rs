//! MegaTrade group-chat client
//!
//! Resolves an operator's identity, opens a room connection, announces
//! presence and mirrors the room's roster and message stream into local
//! stores. A [`SessionHandle`] is the only way in: it owns one session actor
//! task and tears the connection down when closed or dropped.

pub mod config;
pub mod error;
pub mod manager;
pub mod profile;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{ClientConfig, ReconnectPolicy};
pub use error::{ConfigError, ConnectionError, FetchError, SessionError};
pub use manager::{ChatView, ConnectionStatus, SessionHandle, SessionOptions, SessionUpdate};
pub use profile::{AccountProfile, HttpProfileLoader, ProfileLoader};
pub use session::{Applied, InboundEvent, Session, SessionPhase};
pub use store::{HistoryStore, RosterStore};
pub use transport::{Connection, Transport, WsConnection, WsTransport};
