//! Session actor: drives one [`Session`] against a transport.
//!
//! Each session runs as an independent tokio task. Callers talk to it through
//! a [`SessionHandle`], which sends `SessionCommand`s over an mpsc channel.
//! Status reads are lock-free through `ArcSwap`; store changes are fanned out
//! to subscribers as [`SessionUpdate`]s.
//!
//! Lifecycle: resolve identity → connect → announce presence → mirror inbound
//! events. On transport failure the actor backs off and reconnects within the
//! configured budget. Closing (or dropping every handle) tears the session
//! down; nothing is applied afterwards.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use megatrade_protocol::{
    ClientMessage, Message, OperatorIdentity, Participant, ServerMessage, LAGGED_CODE,
};

use crate::config::{ClientConfig, ReconnectPolicy};
use crate::error::{ConnectionError, FetchError, SessionError};
use crate::profile::ProfileLoader;
use crate::session::{Applied, Session};
use crate::transport::{Connection, Transport};

const COMMAND_CAPACITY: usize = 64;
const UPDATE_CAPACITY: usize = 256;

/// How a session connects
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub room_url: String,
    pub is_operator: bool,
    pub reconnect: ReconnectPolicy,
}

impl SessionOptions {
    pub fn new(room_url: impl Into<String>) -> Self {
        Self {
            room_url: room_url.into(),
            is_operator: true,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            room_url: config.room_url(),
            is_operator: true,
            reconnect: config.reconnect.clone(),
        }
    }
}

/// Connection state as shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    ResolvingIdentity,
    /// `attempt` is 0 for the first connection, then the retry number.
    Connecting {
        attempt: u32,
    },
    Active,
    Reconnecting {
        attempt: u32,
        last_error: String,
    },
    Closed {
        error: Option<String>,
    },
}

impl ConnectionStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionStatus::Closed { .. })
    }
}

/// Change notifications for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    IdentityResolved(OperatorIdentity),
    IdentityFailed(FetchError),
    Status(ConnectionStatus),
    RosterReplaced(Vec<Participant>),
    HistoryReplaced(Vec<Message>),
    MessageAppended(Message),
    RelayError { code: String, message: String },
}

/// Read-only snapshot of everything the presentation layer renders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatView {
    pub identity: Option<OperatorIdentity>,
    pub status: ConnectionStatus,
    pub roster: Vec<Participant>,
    pub messages: Vec<Message>,
}

enum SessionCommand {
    SendMessage {
        body: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    RequestHistory {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    GetView {
        reply: oneshot::Sender<ChatView>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Handle to a running session actor (cheap to Clone).
///
/// The session is torn down by [`SessionHandle::close`] or once every clone
/// has been dropped.
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
    status: Arc<ArcSwap<ConnectionStatus>>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionHandle {
    /// Resolve `operator_id` through `loader`, then connect. A failed lookup
    /// closes the session without ever opening a connection.
    pub fn spawn<L, T>(
        operator_id: impl Into<String>,
        loader: L,
        transport: T,
        options: SessionOptions,
    ) -> Self
    where
        L: ProfileLoader,
        T: Transport,
    {
        let operator_id = operator_id.into();
        let (handle, mut command_rx, publisher) = Self::channels(ConnectionStatus::ResolvingIdentity);

        tokio::spawn(async move {
            let identity = resolve_identity(
                &operator_id,
                &loader,
                options.is_operator,
                &mut command_rx,
                &publisher,
            )
            .await;

            if let Some(identity) = identity {
                SessionActor::new(identity, transport, options, publisher)
                    .run(command_rx)
                    .await;
            }
        });

        handle
    }

    /// Connect with an identity that is already known.
    pub fn spawn_with_identity<T: Transport>(
        identity: OperatorIdentity,
        transport: T,
        options: SessionOptions,
    ) -> Self {
        let (handle, command_rx, publisher) =
            Self::channels(ConnectionStatus::Connecting { attempt: 0 });

        tokio::spawn(SessionActor::new(identity, transport, options, publisher).run(command_rx));

        handle
    }

    fn channels(
        initial: ConnectionStatus,
    ) -> (Self, mpsc::Receiver<SessionCommand>, Publisher) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let status = Arc::new(ArcSwap::from_pointee(initial));

        let publisher = Publisher {
            status: status.clone(),
            updates: updates.clone(),
        };
        let handle = Self {
            command_tx,
            status,
            updates,
        };
        (handle, command_rx, publisher)
    }

    /// Lock-free status read.
    pub fn status(&self) -> ConnectionStatus {
        self.status.load_full().as_ref().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.status.load().is_closed()
    }

    /// Subscribe to updates published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Compose a message into the room.
    pub async fn send_message(&self, body: impl Into<String>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::SendMessage {
            body: body.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Ask the relay for a fresh history snapshot.
    pub async fn request_history(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::RequestHistory { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Snapshot of identity, status, roster and messages.
    pub async fn view(&self) -> Result<ChatView, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::GetView { reply }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Tear the session down and wait for the connection to be closed.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(SessionCommand::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn command(&self, cmd: SessionCommand) -> Result<(), SessionError> {
        self.command_tx.send(cmd).await.map_err(|_| SessionError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Publisher: status + update fan-out shared between handle and actor
// ---------------------------------------------------------------------------

struct Publisher {
    status: Arc<ArcSwap<ConnectionStatus>>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl Publisher {
    fn set_status(&self, status: ConnectionStatus) {
        self.status.store(Arc::new(status.clone()));
        self.emit(SessionUpdate::Status(status));
    }

    fn status(&self) -> ConnectionStatus {
        self.status.load_full().as_ref().clone()
    }

    fn emit(&self, update: SessionUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }
}

/// Why the actor stops
enum Teardown {
    /// Every handle was dropped.
    Dropped,
    /// `close()` was called; acknowledged once the session is closed.
    Requested(oneshot::Sender<()>),
}

impl Teardown {
    fn acknowledge(self) {
        if let Teardown::Requested(reply) = self {
            let _ = reply.send(());
        }
    }
}

/// Answer a command while no connection is open. Returns the teardown if the
/// command ends the session.
fn answer_offline(
    cmd: Option<SessionCommand>,
    view: impl FnOnce() -> ChatView,
) -> Option<Teardown> {
    match cmd {
        None => Some(Teardown::Dropped),
        Some(SessionCommand::Close { reply }) => Some(Teardown::Requested(reply)),
        Some(SessionCommand::SendMessage { reply, .. })
        | Some(SessionCommand::RequestHistory { reply }) => {
            let _ = reply.send(Err(SessionError::NotConnected));
            None
        }
        Some(SessionCommand::GetView { reply }) => {
            let _ = reply.send(view());
            None
        }
    }
}

async fn resolve_identity<L: ProfileLoader>(
    operator_id: &str,
    loader: &L,
    is_operator: bool,
    command_rx: &mut mpsc::Receiver<SessionCommand>,
    publisher: &Publisher,
) -> Option<OperatorIdentity> {
    let fetch = loader.fetch_profile(operator_id);
    tokio::pin!(fetch);

    loop {
        tokio::select! {
            biased;

            cmd = command_rx.recv() => {
                let teardown = answer_offline(cmd, || ChatView {
                    identity: None,
                    status: publisher.status(),
                    roster: Vec::new(),
                    messages: Vec::new(),
                });
                if let Some(teardown) = teardown {
                    info!(
                        component = "session",
                        event = "session.identity.abandoned",
                        operator_id = %operator_id,
                        "Session torn down before identity resolved"
                    );
                    publisher.set_status(ConnectionStatus::Closed { error: None });
                    teardown.acknowledge();
                    return None;
                }
            }

            result = &mut fetch => {
                return match result {
                    Ok(profile) => Some(profile.into_identity(operator_id, is_operator)),
                    Err(e) => {
                        warn!(
                            component = "session",
                            event = "session.identity.failed",
                            operator_id = %operator_id,
                            error = %e,
                            "Identity resolution failed, not opening a session"
                        );
                        publisher.emit(SessionUpdate::IdentityFailed(e.clone()));
                        publisher.set_status(ConnectionStatus::Closed {
                            error: Some(SessionError::Fetch(e).to_string()),
                        });
                        None
                    }
                };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SessionActor
// ---------------------------------------------------------------------------

enum Opened<C> {
    Connection(C),
    Failed(ConnectionError),
    TornDown(Teardown),
}

enum Served {
    Lost(ConnectionError),
    TornDown(Teardown),
}

struct SessionActor<T: Transport> {
    session: Session,
    transport: T,
    options: SessionOptions,
    publisher: Publisher,
}

impl<T: Transport> SessionActor<T> {
    fn new(
        identity: OperatorIdentity,
        transport: T,
        options: SessionOptions,
        publisher: Publisher,
    ) -> Self {
        Self {
            session: Session::new(identity),
            transport,
            options,
            publisher,
        }
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<SessionCommand>) {
        self.publisher
            .emit(SessionUpdate::IdentityResolved(self.session.identity().clone()));

        if let Err(e) = self.session.begin_connect() {
            error!(
                component = "session",
                event = "session.connect.invalid",
                error = %e,
            );
            self.finish(Some(e.to_string()));
            return;
        }

        let mut attempt: u32 = 0;
        loop {
            self.publisher
                .set_status(ConnectionStatus::Connecting { attempt });

            let mut conn = match self.open(&mut command_rx).await {
                Opened::Connection(conn) => conn,
                Opened::Failed(e) => {
                    attempt += 1;
                    if self.wait_before_retry(attempt, e, &mut command_rx).await {
                        continue;
                    }
                    return;
                }
                Opened::TornDown(teardown) => {
                    self.finish(None);
                    teardown.acknowledge();
                    return;
                }
            };

            let join = match self.session.connection_opened() {
                Ok(join) => join,
                Err(e) => {
                    error!(
                        component = "session",
                        event = "session.open.invalid",
                        error = %e,
                    );
                    conn.close().await;
                    self.finish(Some(e.to_string()));
                    return;
                }
            };

            if let Err(e) = conn.send(join).await {
                conn.close().await;
                let _ = self.session.connection_lost();
                attempt += 1;
                if self.wait_before_retry(attempt, e, &mut command_rx).await {
                    continue;
                }
                return;
            }

            info!(
                component = "session",
                event = "session.presence.joined",
                operator_id = %self.session.identity().id,
                room_url = %self.options.room_url,
                joins = self.session.joins_sent(),
            );
            attempt = 0;
            self.publisher.set_status(ConnectionStatus::Active);

            match self.serve(&mut conn, &mut command_rx).await {
                Served::TornDown(teardown) => {
                    conn.close().await;
                    self.finish(None);
                    teardown.acknowledge();
                    return;
                }
                Served::Lost(e) => {
                    warn!(
                        component = "session",
                        event = "session.connection.lost",
                        error = %e,
                        "Connection lost"
                    );
                    conn.close().await;
                    let _ = self.session.connection_lost();
                    attempt = 1;
                    if !self.wait_before_retry(attempt, e, &mut command_rx).await {
                        return;
                    }
                }
            }
        }
    }

    async fn open(
        &mut self,
        command_rx: &mut mpsc::Receiver<SessionCommand>,
    ) -> Opened<T::Connection> {
        let url = self.options.room_url.clone();
        let connect = self.transport.connect(&url);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                biased;

                cmd = command_rx.recv() => {
                    if let Some(teardown) = answer_offline(cmd, || self.view()) {
                        return Opened::TornDown(teardown);
                    }
                }

                result = &mut connect => {
                    return match result {
                        Ok(conn) => Opened::Connection(conn),
                        Err(e) => Opened::Failed(e),
                    };
                }
            }
        }
    }

    async fn serve(
        &mut self,
        conn: &mut T::Connection,
        command_rx: &mut mpsc::Receiver<SessionCommand>,
    ) -> Served {
        loop {
            tokio::select! {
                biased;

                cmd = command_rx.recv() => match cmd {
                    None => return Served::TornDown(Teardown::Dropped),
                    Some(SessionCommand::Close { reply }) => {
                        return Served::TornDown(Teardown::Requested(reply));
                    }
                    Some(SessionCommand::SendMessage { body, reply }) => {
                        if let Err(e) = conn.send(ClientMessage::SendMessage { body }).await {
                            let _ = reply.send(Err(e.clone().into()));
                            return Served::Lost(e);
                        }
                        let _ = reply.send(Ok(()));
                    }
                    Some(SessionCommand::RequestHistory { reply }) => {
                        if let Err(e) = conn.send(ClientMessage::RequestHistory).await {
                            let _ = reply.send(Err(e.clone().into()));
                            return Served::Lost(e);
                        }
                        let _ = reply.send(Ok(()));
                    }
                    Some(SessionCommand::GetView { reply }) => {
                        let _ = reply.send(self.view());
                    }
                },

                frame = conn.recv() => match frame {
                    Some(Ok(msg)) => {
                        if let Some(follow_up) = self.apply(msg) {
                            if let Err(e) = conn.send(follow_up).await {
                                return Served::Lost(e);
                            }
                        }
                    }
                    Some(Err(e)) => return Served::Lost(e),
                    None => return Served::Lost(ConnectionError::Lost("closed by relay".to_string())),
                },
            }
        }
    }

    /// Back off before retry `attempt`. Returns `false` when the session is
    /// over, either because the budget is spent or because it was torn down.
    async fn wait_before_retry(
        &mut self,
        attempt: u32,
        error: ConnectionError,
        command_rx: &mut mpsc::Receiver<SessionCommand>,
    ) -> bool {
        let policy = &self.options.reconnect;
        if !policy.allows(attempt) {
            let final_error = if policy.max_attempts == 0 {
                error
            } else {
                ConnectionError::RetriesExhausted {
                    attempts: policy.max_attempts,
                    last_error: error.to_string(),
                }
            };
            error!(
                component = "session",
                event = "session.reconnect.exhausted",
                error = %final_error,
                "Closing session"
            );
            self.finish(Some(final_error.to_string()));
            return false;
        }

        let delay = policy.delay_for(attempt);
        warn!(
            component = "session",
            event = "session.reconnect.scheduled",
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
        );
        self.publisher.set_status(ConnectionStatus::Reconnecting {
            attempt,
            last_error: error.to_string(),
        });

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;

                cmd = command_rx.recv() => {
                    if let Some(teardown) = answer_offline(cmd, || self.view()) {
                        self.finish(None);
                        teardown.acknowledge();
                        return false;
                    }
                }

                _ = &mut sleep => return true,
            }
        }
    }

    /// Apply one inbound frame. Returns a frame to send back, if the event
    /// calls for one.
    fn apply(&mut self, msg: ServerMessage) -> Option<ClientMessage> {
        let event_name = msg.event_name();
        let update = match &msg {
            ServerMessage::RosterUpdated(participants) => {
                SessionUpdate::RosterReplaced(participants.clone())
            }
            ServerMessage::HistorySnapshot(messages) => {
                SessionUpdate::HistoryReplaced(messages.clone())
            }
            ServerMessage::MessageReceived(message) => SessionUpdate::MessageAppended(message.clone()),
            ServerMessage::Error { code, message } => SessionUpdate::RelayError {
                code: code.clone(),
                message: message.clone(),
            },
        };

        let mut follow_up = None;
        match self.session.dispatch(msg.into()) {
            Applied::Discarded => {
                debug!(
                    component = "session",
                    event = "session.inbound.discarded",
                    inbound = event_name,
                );
                return None;
            }
            Applied::RelayError { code, message } if code == LAGGED_CODE => {
                warn!(
                    component = "session",
                    event = "session.inbound.lagged",
                    message = %message,
                    "Relay dropped events for this session, requesting history"
                );
                follow_up = Some(ClientMessage::RequestHistory);
            }
            Applied::RelayError { code, message } => {
                warn!(
                    component = "session",
                    event = "session.inbound.relay_error",
                    code = %code,
                    message = %message,
                );
            }
            applied => {
                debug!(
                    component = "session",
                    event = "session.inbound.applied",
                    inbound = event_name,
                    ?applied,
                    roster = self.session.roster().len(),
                    messages = self.session.history().len(),
                );
            }
        }

        self.publisher.emit(update);
        follow_up
    }

    fn view(&self) -> ChatView {
        ChatView {
            identity: Some(self.session.identity().clone()),
            status: self.publisher.status(),
            roster: self.session.roster().participants().to_vec(),
            messages: self.session.history().messages().to_vec(),
        }
    }

    fn finish(&mut self, error: Option<String>) {
        if self.session.close() {
            info!(
                component = "session",
                event = "session.closed",
                operator_id = %self.session.identity().id,
                error = ?error,
            );
        }
        self.publisher.set_status(ConnectionStatus::Closed { error });
    }
}
