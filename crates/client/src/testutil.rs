//! In-memory transport and profile loaders for session tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use megatrade_protocol::{ClientMessage, ServerMessage};

use crate::error::{ConnectionError, FetchError};
use crate::profile::{AccountProfile, ProfileLoader};
use crate::transport::{Connection, Transport};

const WAIT: Duration = Duration::from_secs(2);

type Inbound = Result<ServerMessage, ConnectionError>;

/// Transport whose connections are handed to a [`FakeServer`] as [`FakePeer`]s.
pub(crate) struct FakeTransport {
    peers_tx: mpsc::UnboundedSender<FakePeer>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    connects: AtomicU32,
    closes: AtomicU32,
    failures_left: AtomicU32,
}

pub(crate) struct FakeServer {
    peers_rx: mpsc::UnboundedReceiver<FakePeer>,
    counters: Arc<Counters>,
}

pub(crate) fn fake_transport() -> (FakeTransport, FakeServer) {
    let (peers_tx, peers_rx) = mpsc::unbounded_channel();
    let counters = Arc::new(Counters::default());
    (
        FakeTransport {
            peers_tx,
            counters: counters.clone(),
        },
        FakeServer { peers_rx, counters },
    )
}

impl FakeServer {
    /// Wait for the next successful connect.
    pub(crate) async fn accept(&mut self) -> FakePeer {
        tokio::time::timeout(WAIT, self.peers_rx.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("transport dropped")
    }

    pub(crate) fn fail_next_connects(&self, n: u32) {
        self.counters.failures_left.store(n, Ordering::SeqCst);
    }

    /// Connect attempts, failed ones included.
    pub(crate) fn connects(&self) -> u32 {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> u32 {
        self.counters.closes.load(Ordering::SeqCst)
    }
}

impl Transport for FakeTransport {
    type Connection = FakeConnection;

    async fn connect(&self, url: &str) -> Result<FakeConnection, ConnectionError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .counters
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectionError::Connect {
                url: url.to_string(),
                reason: "refused".to_string(),
            });
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let _ = self.peers_tx.send(FakePeer {
            inbound: inbound_tx,
            outbound: outbound_rx,
        });

        Ok(FakeConnection {
            inbound: inbound_rx,
            outbound: outbound_tx,
            counters: self.counters.clone(),
        })
    }
}

pub(crate) struct FakeConnection {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    counters: Arc<Counters>,
}

impl Connection for FakeConnection {
    async fn send(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        let event = msg.event_name();
        self.outbound.send(msg).map_err(|_| ConnectionError::Send {
            event,
            reason: "peer gone".to_string(),
        })
    }

    async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    async fn close(self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Relay side of one fake connection. Dropping it hangs up.
pub(crate) struct FakePeer {
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
}

impl FakePeer {
    pub(crate) fn push(&self, msg: ServerMessage) {
        let _ = self.inbound.send(Ok(msg));
    }

    pub(crate) fn fail(&self, err: ConnectionError) {
        let _ = self.inbound.send(Err(err));
    }

    pub(crate) async fn next_outbound(&mut self) -> ClientMessage {
        tokio::time::timeout(WAIT, self.outbound.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("connection dropped")
    }

    pub(crate) fn try_outbound(&mut self) -> Option<ClientMessage> {
        self.outbound.try_recv().ok()
    }
}

/// Loader that answers immediately with a fixed result.
pub(crate) struct StaticProfileLoader(Result<AccountProfile, FetchError>);

impl StaticProfileLoader {
    pub(crate) fn ok(profile: AccountProfile) -> Self {
        Self(Ok(profile))
    }

    pub(crate) fn err(message: &str) -> Self {
        Self(Err(FetchError::new(message)))
    }
}

impl ProfileLoader for StaticProfileLoader {
    async fn fetch_profile(&self, _operator_id: &str) -> Result<AccountProfile, FetchError> {
        self.0.clone()
    }
}

/// Loader that blocks until its gate is notified.
pub(crate) struct GatedProfileLoader {
    gate: Arc<Notify>,
    profile: AccountProfile,
}

impl GatedProfileLoader {
    pub(crate) fn new(profile: AccountProfile) -> Self {
        Self {
            gate: Arc::new(Notify::new()),
            profile,
        }
    }

    pub(crate) fn gate(&self) -> Arc<Notify> {
        self.gate.clone()
    }
}

impl ProfileLoader for GatedProfileLoader {
    async fn fetch_profile(&self, _operator_id: &str) -> Result<AccountProfile, FetchError> {
        self.gate.notified().await;
        Ok(self.profile.clone())
    }
}
