//! WebSocket handling for chat rooms

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use megatrade_protocol::{ClientMessage, ServerMessage, LAGGED_CODE};

use crate::state::{Joined, Room, RoomRegistry};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Messages that can be sent through the WebSocket
enum OutboundMessage {
    /// JSON-serialized ServerMessage
    Json(ServerMessage),
    /// Raw pong response
    Pong(Bytes),
}

/// WebSocket upgrade handler for `/chat/{room}`
pub async fn ws_handler(
    Path(room): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<RoomRegistry>>,
) -> impl IntoResponse {
    let room = state.room(&room);
    ws.on_upgrade(move |socket| handle_socket(socket, state, room))
}

/// Per-connection state
struct ConnectionContext {
    conn_id: u64,
    registry: Arc<RoomRegistry>,
    room: Arc<Room>,
    forwarder: Option<JoinHandle<()>>,
}

impl ConnectionContext {
    fn new(registry: Arc<RoomRegistry>, room: Arc<Room>) -> Self {
        Self {
            conn_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            registry,
            room,
            forwarder: None,
        }
    }

    fn joined(&self) -> bool {
        self.forwarder.is_some()
    }

    /// Stop forwarding room events, leave the roster and hand the room back.
    async fn finish(mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if self.room.leave(self.conn_id).await {
            info!(
                component = "websocket",
                event = "room.left",
                connection_id = self.conn_id,
                room = %self.room.name(),
            );
        }

        let name = self.room.name().to_string();
        if self.registry.release(self.room) {
            debug!(
                component = "websocket",
                event = "room.evicted",
                room = %name,
            );
        }
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, registry: Arc<RoomRegistry>, room: Arc<Room>) {
    let mut ctx = ConnectionContext::new(registry, room);
    let conn_id = ctx.conn_id;
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        room = %ctx.room.name(),
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(100);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = msg.len(),
                    payload_preview = %truncate_for_log(&msg, 240),
                    "Failed to parse client message"
                );
                send_error(&outbound_tx, "parse_error", e.to_string()).await;
                continue;
            }
        };

        handle_client_message(client_msg, &outbound_tx, &mut ctx).await;
    }

    ctx.finish().await;
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        "WebSocket connection closed"
    );
    send_task.abort();
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Send a ServerMessage through the outbound channel
async fn send_json(tx: &mpsc::Sender<OutboundMessage>, msg: ServerMessage) {
    let _ = tx.send(OutboundMessage::Json(msg)).await;
}

async fn send_error(tx: &mpsc::Sender<OutboundMessage>, code: &str, message: impl Into<String>) {
    send_json(
        tx,
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        },
    )
    .await;
}

/// Spawn a task that drains a room's broadcast receiver into this connection's
/// outbound channel. It exits when the client disconnects or the room goes away.
///
/// A subscriber that falls behind the broadcast buffer gets a `lagged` error so
/// it can ask for a fresh snapshot.
fn spawn_broadcast_forwarder(
    mut rx: broadcast::Receiver<ServerMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    conn_id: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if outbound_tx.send(OutboundMessage::Json(msg)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        component = "websocket",
                        event = "ws.broadcast.lagged",
                        connection_id = conn_id,
                        skipped = n,
                        "Broadcast subscriber lagged, skipped {n} messages"
                    );
                    let _ = outbound_tx
                        .send(OutboundMessage::Json(ServerMessage::Error {
                            code: LAGGED_CODE.to_string(),
                            message: format!("Subscriber lagged, skipped {n} messages"),
                        }))
                        .await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn handle_client_message(
    msg: ClientMessage,
    client_tx: &mpsc::Sender<OutboundMessage>,
    ctx: &mut ConnectionContext,
) {
    match msg {
        ClientMessage::PresenceJoin(identity) => {
            if identity.id.trim().is_empty() {
                send_error(client_tx, "invalid_identity", "Operator id must not be empty").await;
                return;
            }

            if let Some(previous) = ctx.forwarder.take() {
                previous.abort();
            }

            let Joined { history, rx } = ctx.room.join(ctx.conn_id, &identity).await;
            info!(
                component = "websocket",
                event = "room.joined",
                connection_id = ctx.conn_id,
                room = %ctx.room.name(),
                operator_id = %identity.id,
                is_operator = identity.is_operator,
                history_len = history.len(),
            );

            // Snapshot goes out before any broadcast this connection can see.
            send_json(client_tx, ServerMessage::HistorySnapshot(history)).await;
            ctx.forwarder = Some(spawn_broadcast_forwarder(
                rx,
                client_tx.clone(),
                ctx.conn_id,
            ));
        }

        ClientMessage::SendMessage { body } => match ctx.room.post(ctx.conn_id, &body).await {
            Ok(message) => {
                debug!(
                    component = "websocket",
                    event = "room.message.posted",
                    connection_id = ctx.conn_id,
                    room = %ctx.room.name(),
                    sender_id = %message.sender_id,
                    body_chars = message.body.chars().count(),
                );
            }
            Err(e) => {
                debug!(
                    component = "websocket",
                    event = "room.message.rejected",
                    connection_id = ctx.conn_id,
                    joined = ctx.joined(),
                    code = e.code(),
                );
                send_error(client_tx, e.code(), e.to_string()).await;
            }
        },

        ClientMessage::RequestHistory => {
            let history = ctx.room.history().await;
            send_json(client_tx, ServerMessage::HistorySnapshot(history)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        handle_client_message, spawn_broadcast_forwarder, ConnectionContext, OutboundMessage,
    };
    use crate::state::RoomRegistry;
    use megatrade_protocol::{ClientMessage, OperatorIdentity, ServerMessage};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc};

    const WAIT: Duration = Duration::from_secs(2);

    fn identity(id: &str, name: &str) -> OperatorIdentity {
        OperatorIdentity {
            id: id.to_string(),
            is_operator: true,
            avatar_url: format!("https://cdn.example.com/{id}.png"),
            display_name: name.to_string(),
        }
    }

    async fn next_json(rx: &mut mpsc::Receiver<OutboundMessage>) -> ServerMessage {
        loop {
            let msg = tokio::time::timeout(WAIT, rx.recv())
                .await
                .expect("timed out waiting for outbound message")
                .expect("outbound channel closed");
            if let OutboundMessage::Json(msg) = msg {
                return msg;
            }
        }
    }

    fn roster_ids(msg: ServerMessage) -> Vec<String> {
        match msg {
            ServerMessage::RosterUpdated(p) => p.into_iter().map(|p| p.id).collect(),
            other => panic!("expected roster, got {:?}", other),
        }
    }

    struct TestClient {
        ctx: ConnectionContext,
        tx: mpsc::Sender<OutboundMessage>,
        rx: mpsc::Receiver<OutboundMessage>,
    }

    impl TestClient {
        fn new(registry: &Arc<RoomRegistry>) -> Self {
            let (tx, rx) = mpsc::channel(64);
            Self {
                ctx: ConnectionContext::new(registry.clone(), registry.room("chat-group")),
                tx,
                rx,
            }
        }

        async fn send(&mut self, msg: ClientMessage) {
            handle_client_message(msg, &self.tx, &mut self.ctx).await;
        }

        async fn next(&mut self) -> ServerMessage {
            next_json(&mut self.rx).await
        }
    }

    #[tokio::test]
    async fn join_sends_history_snapshot_before_roster() {
        let registry = Arc::new(RoomRegistry::new(None));
        let mut jane = TestClient::new(&registry);

        jane.send(ClientMessage::PresenceJoin(identity("op-1", "Jane Doe")))
            .await;

        assert_eq!(jane.next().await, ServerMessage::HistorySnapshot(vec![]));
        assert_eq!(roster_ids(jane.next().await), vec!["op-1"]);
    }

    #[tokio::test]
    async fn send_before_join_is_rejected() {
        let registry = Arc::new(RoomRegistry::new(None));
        let mut client = TestClient::new(&registry);

        client
            .send(ClientMessage::SendMessage {
                body: "hello?".into(),
            })
            .await;

        match client.next().await {
            ServerMessage::Error { code, .. } => assert_eq!(code, "not_joined"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(registry.room("chat-group").history().await.is_empty());
    }

    #[tokio::test]
    async fn blank_operator_id_is_rejected() {
        let registry = Arc::new(RoomRegistry::new(None));
        let mut client = TestClient::new(&registry);

        client
            .send(ClientMessage::PresenceJoin(identity(" ", "Nobody")))
            .await;

        match client.next().await {
            ServerMessage::Error { code, .. } => assert_eq!(code, "invalid_identity"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(registry.room("chat-group").roster().await.is_empty());
    }

    #[tokio::test]
    async fn messages_reach_every_member_including_sender() {
        let registry = Arc::new(RoomRegistry::new(None));
        let mut jane = TestClient::new(&registry);
        let mut sam = TestClient::new(&registry);

        jane.send(ClientMessage::PresenceJoin(identity("op-1", "Jane Doe")))
            .await;
        jane.next().await;
        jane.next().await;
        sam.send(ClientMessage::PresenceJoin(identity("op-2", "Sam Lee")))
            .await;
        sam.next().await;
        assert_eq!(roster_ids(sam.next().await), vec!["op-1", "op-2"]);
        assert_eq!(roster_ids(jane.next().await), vec!["op-1", "op-2"]);

        jane.send(ClientMessage::SendMessage { body: "hi".into() })
            .await;

        for client in [&mut jane, &mut sam] {
            match client.next().await {
                ServerMessage::MessageReceived(m) => {
                    assert_eq!(m.sender_id, "op-1");
                    assert_eq!(m.sender_name, "Jane Doe");
                    assert_eq!(m.body, "hi");
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn late_joiner_receives_prior_history() {
        let registry = Arc::new(RoomRegistry::new(None));
        let mut jane = TestClient::new(&registry);
        jane.send(ClientMessage::PresenceJoin(identity("op-1", "Jane Doe")))
            .await;
        jane.send(ClientMessage::SendMessage { body: "hi".into() })
            .await;
        jane.send(ClientMessage::SendMessage {
            body: "hello".into(),
        })
        .await;

        let mut sam = TestClient::new(&registry);
        sam.send(ClientMessage::PresenceJoin(identity("op-2", "Sam Lee")))
            .await;

        match sam.next().await {
            ServerMessage::HistorySnapshot(history) => {
                let bodies: Vec<&str> = history.iter().map(|m| m.body.as_str()).collect();
                assert_eq!(bodies, vec!["hi", "hello"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn history_request_answers_only_the_requester() {
        let registry = Arc::new(RoomRegistry::new(None));
        let mut jane = TestClient::new(&registry);
        jane.send(ClientMessage::PresenceJoin(identity("op-1", "Jane Doe")))
            .await;
        jane.next().await;
        jane.next().await;
        jane.send(ClientMessage::SendMessage { body: "hi".into() })
            .await;
        jane.next().await;

        let mut lurker = TestClient::new(&registry);
        lurker.send(ClientMessage::RequestHistory).await;

        match lurker.next().await {
            ServerMessage::HistorySnapshot(history) => assert_eq!(history.len(), 1),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(jane.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn finishing_a_connection_updates_the_roster() {
        let registry = Arc::new(RoomRegistry::new(None));
        let mut jane = TestClient::new(&registry);
        let mut sam = TestClient::new(&registry);
        jane.send(ClientMessage::PresenceJoin(identity("op-1", "Jane Doe")))
            .await;
        sam.send(ClientMessage::PresenceJoin(identity("op-2", "Sam Lee")))
            .await;
        jane.next().await;
        jane.next().await;
        jane.next().await;

        sam.ctx.finish().await;

        assert_eq!(roster_ids(jane.next().await), vec!["op-1"]);
    }

    #[tokio::test]
    async fn last_connection_out_evicts_the_room() {
        let registry = Arc::new(RoomRegistry::new(None));
        let mut jane = TestClient::new(&registry);
        let lurker = TestClient::new(&registry);
        jane.send(ClientMessage::PresenceJoin(identity("op-1", "Jane Doe")))
            .await;
        jane.send(ClientMessage::SendMessage { body: "hi".into() })
            .await;

        jane.ctx.finish().await;
        assert_eq!(registry.len(), 1);

        lurker.ctx.finish().await;
        assert!(registry.is_empty());
        assert!(registry.room("chat-group").history().await.is_empty());
    }

    #[tokio::test]
    async fn rejoin_replaces_forwarder_without_duplicates() {
        let registry = Arc::new(RoomRegistry::new(None));
        let mut jane = TestClient::new(&registry);
        jane.send(ClientMessage::PresenceJoin(identity("op-1", "Jane")))
            .await;
        jane.send(ClientMessage::PresenceJoin(identity("op-1", "Jane Doe")))
            .await;
        jane.send(ClientMessage::SendMessage { body: "once".into() })
            .await;

        let mut received = 0;
        while let Ok(Some(msg)) =
            tokio::time::timeout(Duration::from_millis(200), jane.rx.recv()).await
        {
            if let OutboundMessage::Json(ServerMessage::MessageReceived(_)) = msg {
                received += 1;
            }
        }
        assert_eq!(received, 1);
    }

    #[tokio::test]
    async fn lagging_forwarder_reports_lagged_error() {
        let (btx, brx) = broadcast::channel(2);
        for n in 0..4 {
            btx.send(ServerMessage::Error {
                code: "test".into(),
                message: n.to_string(),
            })
            .expect("send");
        }

        let (tx, mut rx) = mpsc::channel(16);
        let _forwarder = spawn_broadcast_forwarder(brx, tx, 99);

        match next_json(&mut rx).await {
            ServerMessage::Error { code, message } => {
                assert_eq!(code, "lagged");
                assert!(message.contains("skipped 2"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        match next_json(&mut rx).await {
            ServerMessage::Error { message, .. } => assert_eq!(message, "2"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    mod end_to_end {
        use super::*;
        use megatrade_client::{
            ConnectionStatus, ReconnectPolicy, SessionHandle, SessionOptions, SessionUpdate,
            WsTransport,
        };

        async fn serve(auth_token: Option<&str>) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind");
            let addr = listener.local_addr().expect("addr");
            let app = crate::app(
                Arc::new(RoomRegistry::new(None)),
                auth_token.map(str::to_string),
            );
            tokio::spawn(async move {
                let _ = axum::serve(listener, app).await;
            });
            format!("ws://{addr}/chat/chat-group")
        }

        fn options(url: String) -> SessionOptions {
            SessionOptions {
                reconnect: ReconnectPolicy::disabled(),
                ..SessionOptions::new(url)
            }
        }

        async fn wait_for(
            updates: &mut broadcast::Receiver<SessionUpdate>,
            pred: impl Fn(&SessionUpdate) -> bool,
        ) -> SessionUpdate {
            tokio::time::timeout(WAIT, async {
                loop {
                    match updates.recv().await {
                        Ok(update) if pred(&update) => return update,
                        Ok(_) => continue,
                        Err(e) => panic!("update stream ended: {e}"),
                    }
                }
            })
            .await
            .expect("timed out waiting for update")
        }

        #[tokio::test]
        async fn client_session_joins_and_chats_through_relay() {
            let url = serve(None).await;
            let handle = SessionHandle::spawn_with_identity(
                identity("op-1", "Jane Doe"),
                WsTransport::new(None),
                options(url),
            );
            let mut updates = handle.subscribe();

            wait_for(&mut updates, |u| {
                matches!(u, SessionUpdate::RosterReplaced(r) if r.len() == 1)
            })
            .await;
            handle.send_message("hi").await.expect("send");
            let appended = wait_for(&mut updates, |u| {
                matches!(u, SessionUpdate::MessageAppended(_))
            })
            .await;

            match appended {
                SessionUpdate::MessageAppended(m) => {
                    assert_eq!(m.body, "hi");
                    assert_eq!(m.sender_name, "Jane Doe");
                }
                other => panic!("unexpected: {:?}", other),
            }
            let view = handle.view().await.expect("view");
            assert_eq!(view.status, ConnectionStatus::Active);
            assert_eq!(view.messages.len(), 1);

            handle.close().await;
            assert!(handle.is_closed());
        }

        #[tokio::test]
        async fn relay_rejects_sessions_without_token() {
            let url = serve(Some("s3cret")).await;

            let rejected =
                SessionHandle::spawn_with_identity(identity("op-1", "Jane"), WsTransport::new(None), options(url.clone()));
            let mut updates = rejected.subscribe();
            wait_for(&mut updates, |u| {
                matches!(u, SessionUpdate::Status(ConnectionStatus::Closed { error: Some(_) }))
            })
            .await;

            let accepted = SessionHandle::spawn_with_identity(
                identity("op-1", "Jane"),
                WsTransport::new(Some("s3cret".to_string())),
                options(url),
            );
            let mut updates = accepted.subscribe();
            wait_for(&mut updates, |u| {
                matches!(u, SessionUpdate::Status(ConnectionStatus::Active))
            })
            .await;
            accepted.close().await;
        }
    }
}
