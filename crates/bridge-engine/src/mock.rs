//! Scriptable protocol connector for deterministic tests and local runs.
//!
//! Every connection's event sender stays with the connector, so a test drives a
//! session by emitting events as the network would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bridge_core::{
    protocol::has_identity, AuthState, Connection, ConnectionHandle, ConnectionId, Material,
    MessageId, ProtocolConnector, ProtocolError, ProtocolEvent, SessionId,
};
use bridge_store::StoreError;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::relay::{InboundPayload, Relay, StatusPayload};

/// Shared state of one mock connection.
#[derive(Default)]
pub struct MockLink {
    terminated: AtomicBool,
    logged_out: AtomicBool,
    sent: Mutex<Vec<(String, String)>>,
}

impl MockLink {
    pub fn is_live(&self) -> bool {
        !self.terminated.load(Ordering::SeqCst)
    }

    pub fn logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    /// `(recipient, text)` pairs in send order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

struct MockConnection {
    events: mpsc::Sender<ProtocolEvent>,
    link: Arc<MockLink>,
    auth: AuthState,
}

pub struct MockConnector {
    connections: Mutex<HashMap<SessionId, Vec<MockConnection>>>,
    connects: AtomicUsize,
    fail_connects: AtomicUsize,
    messages: Arc<AtomicUsize>,
    issue_challenge: bool,
    open_with_credentials: bool,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Unpaired connections get a pairing challenge right away; paired ones open.
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            connects: AtomicUsize::new(0),
            fail_connects: AtomicUsize::new(0),
            messages: Arc::new(AtomicUsize::new(0)),
            issue_challenge: true,
            open_with_credentials: true,
        }
    }

    /// Emit nothing on connect; the test drives every event.
    pub fn manual() -> Self {
        Self {
            issue_challenge: false,
            open_with_credentials: false,
            ..Self::new()
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connects_for(&self, id: &SessionId) -> usize {
        self.connections.lock().get(id).map_or(0, Vec::len)
    }

    /// Connections of `id` that have not been terminated.
    pub fn live_connections(&self, id: &SessionId) -> usize {
        self.connections
            .lock()
            .get(id)
            .map_or(0, |conns| conns.iter().filter(|c| c.link.is_live()).count())
    }

    pub fn latest_link(&self, id: &SessionId) -> Option<Arc<MockLink>> {
        self.connections
            .lock()
            .get(id)
            .and_then(|conns| conns.last())
            .map(|c| c.link.clone())
    }

    /// Auth state the latest connection of `id` was seeded with.
    pub fn latest_auth(&self, id: &SessionId) -> Option<AuthState> {
        self.connections
            .lock()
            .get(id)
            .and_then(|conns| conns.last())
            .map(|c| c.auth.clone())
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Deliver an event on the latest connection of `id`. Returns false when
    /// there is no live connection to deliver on.
    pub async fn emit(&self, id: &SessionId, event: ProtocolEvent) -> bool {
        let sender = {
            let conns = self.connections.lock();
            match conns.get(id).and_then(|c| c.last()) {
                Some(c) if c.link.is_live() => c.events.clone(),
                _ => return false,
            }
        };
        sender.send(event).await.is_ok()
    }

    /// Drop the latest connection's event sender, ending its stream.
    pub fn hang_up(&self, id: &SessionId) {
        if let Some(conns) = self.connections.lock().get_mut(id) {
            if let Some(last) = conns.last_mut() {
                let (closed, _) = mpsc::channel(1);
                last.events = closed;
            }
        }
    }
}

#[async_trait]
impl ProtocolConnector for MockConnector {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(
        &self,
        session_id: &SessionId,
        auth: AuthState,
        event_buffer: usize,
    ) -> Result<Connection, ProtocolError> {
        let fail = self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ProtocolError::ConnectFailed("injected failure".into()));
        }
        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;

        let (tx, rx) = mpsc::channel(event_buffer.max(4));
        let identity = auth
            .credentials
            .as_ref()
            .filter(|c| has_identity(c))
            .and_then(|c| c.get("me"))
            .and_then(|me| me.get("id"))
            .and_then(Material::as_text)
            .map(str::to_string);
        match identity {
            Some(me) if self.open_with_credentials => {
                let _ = tx.try_send(ProtocolEvent::Open { me, push_name: None });
            }
            None if self.issue_challenge => {
                let _ = tx.try_send(ProtocolEvent::PairingChallenge {
                    code: format!("2@mock-{n},{session_id}"),
                });
            }
            _ => {}
        }

        let link = Arc::new(MockLink::default());
        self.connections
            .lock()
            .entry(session_id.clone())
            .or_default()
            .push(MockConnection {
                events: tx,
                link: link.clone(),
                auth,
            });

        Ok(Connection {
            handle: Box::new(MockHandle {
                id: ConnectionId::new(),
                link,
                sequence: self.messages.clone(),
            }),
            events: rx,
        })
    }
}

struct MockHandle {
    id: ConnectionId,
    link: Arc<MockLink>,
    sequence: Arc<AtomicUsize>,
}

#[async_trait]
impl ConnectionHandle for MockHandle {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<MessageId, ProtocolError> {
        if !self.link.is_live() {
            return Err(ProtocolError::Closed);
        }
        self.link.sent.lock().push((to.to_string(), text.to_string()));
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MessageId::from_raw(format!("MOCK{n:06}")))
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.link.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate(&self) {
        self.link.terminated.store(true, Ordering::SeqCst);
    }
}

/// Relay that records what it is asked to forward.
#[derive(Default)]
pub struct RecordingRelay {
    messages: Mutex<Vec<InboundPayload>>,
    statuses: Mutex<Vec<StatusPayload>>,
    failing: AtomicBool,
}

impl RecordingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<InboundPayload> {
        self.messages.lock().clone()
    }

    pub fn statuses(&self) -> Vec<StatusPayload> {
        self.statuses.lock().clone()
    }

    /// Fail every call after recording it.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn outcome(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Status {
                status: 502,
                body: "relay unavailable".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Relay for RecordingRelay {
    async fn forward_message(&self, payload: &InboundPayload) -> Result<(), StoreError> {
        self.messages.lock().push(payload.clone());
        self.outcome()
    }

    async fn notify_status(&self, payload: &StatusPayload) -> Result<(), StoreError> {
        self.statuses.lock().push(payload.clone());
        self.outcome()
    }
}
