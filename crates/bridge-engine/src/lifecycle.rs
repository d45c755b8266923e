//! Session actor.
//!
//! Each session is owned by one task. Protocol events, management commands and
//! the reconnect timer are all handled inside that task, so the connection
//! handle, the in-memory auth state and the status never need a lock of their
//! own. The actor publishes a [`SessionSnapshot`] for readers; nothing else
//! writes it.

use std::sync::Arc;
use std::time::Duration;

use bridge_core::{
    address, AuthState, CloseReason, ConnectionHandle, MessageId, ProtocolConnector,
    ProtocolEvent, SessionId, SessionStatus,
};
use bridge_store::{AuthSync, CredentialStore, StoreError, StoredAuth};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn, Instrument};

use crate::error::SessionError;
use crate::qr;
use crate::relay::{normalize_inbound, Relay, StatusPayload};

/// Lifecycle tuning shared by every session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub reconnect_delay: Duration,
    pub key_flush_window: Duration,
    /// Upper bound on the initial credential load. Past it the session pairs fresh.
    pub load_timeout: Duration,
    pub event_buffer: usize,
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            key_flush_window: Duration::from_millis(500),
            load_timeout: Duration::from_secs(10),
            event_buffer: 256,
            command_buffer: 32,
        }
    }
}

/// Collaborators every session actor is built with.
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn ProtocolConnector>,
    pub store: Arc<dyn CredentialStore>,
    pub relay: Arc<dyn Relay>,
    pub config: SessionConfig,
}

/// Point-in-time view of one session. Carries no secrets.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub status: SessionStatus,
    pub connected: bool,
    pub phone_number: Option<String>,
    /// Current pairing challenge as an image data URL.
    pub qr: Option<String>,
    pub push_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn not_started(id: SessionId) -> Self {
        Self {
            id,
            status: SessionStatus::NotStarted,
            connected: false,
            phone_number: None,
            qr: None,
            push_name: None,
            updated_at: Utc::now(),
        }
    }

    pub fn has_qr(&self) -> bool {
        self.qr.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartMode {
    /// Pair fresh when no credentials are stored.
    Interactive,
    /// Only resume stored credentials; never issue a pairing challenge.
    Restore,
}

pub(crate) enum Command {
    Start {
        mode: StartMode,
        reply: oneshot::Sender<Result<SessionSnapshot, SessionError>>,
    },
    Send {
        to: String,
        text: String,
        reply: oneshot::Sender<Result<MessageId, SessionError>>,
    },
    /// Flush, close the connection, keep credentials, stop.
    Disconnect { reply: oneshot::Sender<()> },
    /// Unlink, close, purge credentials, stop.
    Logout {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// Registry-side handle to a running session actor.
pub(crate) struct SessionEntry {
    pub id: SessionId,
    pub commands: mpsc::Sender<Command>,
    pub snapshot: Arc<RwLock<SessionSnapshot>>,
    pub task: JoinHandle<()>,
}

impl SessionEntry {
    pub fn spawn(id: SessionId, deps: &SessionDeps) -> Self {
        let (commands, rx) = mpsc::channel(deps.config.command_buffer.max(1));
        let snapshot = Arc::new(RwLock::new(SessionSnapshot::not_started(id.clone())));
        let actor = SessionActor::new(id.clone(), deps.clone(), snapshot.clone());
        let span = tracing::info_span!("session", session_id = %id);
        let task = tokio::spawn(actor.run(rx).instrument(span));
        Self {
            id,
            commands,
            snapshot,
            task,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().clone()
    }

    /// Send a command and wait for its reply.
    pub async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::ChannelClosed(self.id.clone()))?;
        rx.await
            .map_err(|_| SessionError::ChannelClosed(self.id.clone()))
    }
}

struct SessionActor {
    id: SessionId,
    deps: SessionDeps,
    snapshot: Arc<RwLock<SessionSnapshot>>,
    sync: AuthSync,
    /// `None` until the first start has loaded from the store.
    auth: Option<AuthState>,
    handle: Option<Box<dyn ConnectionHandle>>,
    events: Option<mpsc::Receiver<ProtocolEvent>>,
    reconnect_at: Option<Instant>,
}

impl SessionActor {
    fn new(id: SessionId, deps: SessionDeps, snapshot: Arc<RwLock<SessionSnapshot>>) -> Self {
        let sync = AuthSync::new(
            id.clone(),
            deps.store.clone(),
            deps.config.key_flush_window,
        );
        Self {
            id,
            deps,
            snapshot,
            sync,
            auth: None,
            handle: None,
            events: None,
            reconnect_at: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.teardown().await;
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!("event stream ended without close");
                        self.handle_close(CloseReason::ConnectionLost).await;
                    }
                },
                () = sleep_until(self.reconnect_at.unwrap_or_else(Instant::now)), if self.reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.reconnect().await;
                }
            }
        }
        debug!("session actor stopped");
    }

    async fn handle_command(&mut self, command: Command) -> std::ops::ControlFlow<()> {
        use std::ops::ControlFlow;

        match command {
            Command::Start { mode, reply } => {
                let result = self.start(mode).await;
                let _ = reply.send(result);
                ControlFlow::Continue(())
            }
            Command::Send { to, text, reply } => {
                let _ = reply.send(self.send(&to, &text).await);
                ControlFlow::Continue(())
            }
            Command::Disconnect { reply } => {
                self.teardown().await;
                info!("session disconnected");
                let _ = reply.send(());
                ControlFlow::Break(())
            }
            Command::Logout { reply } => {
                let _ = reply.send(self.logout().await);
                ControlFlow::Break(())
            }
        }
    }

    async fn start(&mut self, mode: StartMode) -> Result<SessionSnapshot, SessionError> {
        let current = self.snapshot.read().clone();
        match current.status {
            SessionStatus::Connected => return Ok(current),
            SessionStatus::Qr if current.has_qr() => return Ok(current),
            _ => {}
        }

        let auth = match self.auth.clone() {
            Some(auth) => auth,
            None => {
                let loaded = self.load().await?;
                let auth = loaded.into_auth_state();
                self.auth = Some(auth.clone());
                auth
            }
        };
        if mode == StartMode::Restore && !auth.has_credentials() {
            info!("no stored credentials, skipping restore");
            return Err(SessionError::NoCredentials(self.id.clone()));
        }

        self.reconnect_at = None;
        if self.connect(auth).await.is_err() {
            // Opening the connection is retried like any other transient drop.
            self.set_status(SessionStatus::Reconnecting);
            self.arm_reconnect();
        }
        Ok(self.snapshot.read().clone())
    }

    async fn load(&self) -> Result<StoredAuth, SessionError> {
        let load = self.deps.store.load(&self.id);
        match tokio::time::timeout(self.deps.config.load_timeout, load).await {
            Ok(Ok(auth)) => Ok(auth),
            Ok(Err(StoreError::Timeout)) | Err(_) => {
                warn!("credential load timed out, starting without stored credentials");
                Ok(StoredAuth::empty())
            }
            Ok(Err(e)) => {
                error!(error = %e, "credential load failed");
                Err(e.into())
            }
        }
    }

    /// Replace any live connection with a fresh one seeded from `auth`.
    async fn connect(&mut self, auth: AuthState) -> Result<(), SessionError> {
        self.drop_connection().await;
        self.set_status(SessionStatus::Connecting);

        let paired = auth.has_credentials();
        match self
            .deps
            .connector
            .connect(&self.id, auth, self.deps.config.event_buffer)
            .await
        {
            Ok(conn) => {
                info!(connection_id = %conn.handle.id(), paired, connector = self.deps.connector.name(), "connection opened");
                self.handle = Some(conn.handle);
                self.events = Some(conn.events);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "connect failed");
                Err(e.into())
            }
        }
    }

    async fn reconnect(&mut self) {
        let auth = self.auth.clone().unwrap_or_default();
        info!("reconnecting");
        if self.connect(auth).await.is_err() {
            self.set_status(SessionStatus::Reconnecting);
            self.arm_reconnect();
        }
    }

    async fn send(&mut self, to: &str, text: &str) -> Result<MessageId, SessionError> {
        let status = self.snapshot.read().status;
        let handle = match (&self.handle, status) {
            (Some(handle), SessionStatus::Connected) => handle,
            _ => {
                return Err(SessionError::NotConnected {
                    session_id: self.id.clone(),
                    status,
                })
            }
        };
        let recipient = address::to_recipient(to)
            .ok_or_else(|| SessionError::InvalidRequest("recipient is required".into()))?;
        if text.trim().is_empty() {
            return Err(SessionError::InvalidRequest("message is required".into()));
        }
        let id = handle.send_text(&recipient, text).await?;
        debug!(message_id = %id, "message sent");
        Ok(id)
    }

    async fn logout(&mut self) -> Result<(), SessionError> {
        if let Some(handle) = &self.handle {
            if let Err(e) = handle.logout().await {
                warn!(error = %e, "device unlink failed");
            }
        }
        self.reconnect_at = None;
        self.drop_connection().await;
        self.sync.discard().await;
        self.auth = None;
        self.deps.store.purge(&self.id).await?;
        info!("session logged out and purged");
        Ok(())
    }

    /// Flush pending key writes and close the connection. Credentials stay.
    async fn teardown(&mut self) {
        self.reconnect_at = None;
        if let Err(e) = self.sync.flush().await {
            warn!(error = %e, "final key flush failed");
        }
        self.drop_connection().await;
    }

    async fn drop_connection(&mut self) {
        self.events = None;
        if let Some(handle) = self.handle.take() {
            debug!(connection_id = %handle.id(), "terminating connection");
            handle.terminate().await;
        }
    }

    async fn handle_event(&mut self, event: ProtocolEvent) {
        debug!(event = event.kind(), "protocol event");
        match event {
            ProtocolEvent::PairingChallenge { code } => match qr::render_data_url(&code) {
                Ok(image) => {
                    if self.set_status(SessionStatus::Qr) {
                        self.snapshot.write().qr = Some(image);
                        info!("pairing challenge issued");
                    }
                }
                Err(e) => error!(error = %e, "pairing challenge render failed"),
            },
            ProtocolEvent::Paired => {
                self.set_status(SessionStatus::Connecting);
            }
            ProtocolEvent::Open { me, push_name } => {
                let phone = address::user_part(&me).to_string();
                if self.set_status(SessionStatus::Connected) {
                    {
                        let mut snap = self.snapshot.write();
                        snap.phone_number = Some(phone.clone());
                        snap.push_name = push_name;
                    }
                    self.reconnect_at = None;
                    info!(phone_number = %phone, "session connected");
                    self.notify(StatusPayload::connected(&self.id, &phone));
                }
            }
            ProtocolEvent::Closed { reason } => self.handle_close(reason).await,
            ProtocolEvent::CredentialsUpdated { credentials } => {
                self.auth.get_or_insert_with(AuthState::default).credentials =
                    Some(credentials.clone());
                self.sync.save_credentials(credentials);
            }
            ProtocolEvent::KeysUpdated { set, delete } => {
                let auth = self.auth.get_or_insert_with(AuthState::default);
                for key in &delete {
                    auth.keys.remove(key);
                }
                auth.keys
                    .extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
                self.sync.queue_keys(set, delete);
            }
            ProtocolEvent::Message(msg) => {
                let Some(payload) = normalize_inbound(&self.id, &msg) else {
                    return;
                };
                let relay = self.deps.relay.clone();
                tokio::spawn(
                    async move {
                        if let Err(e) = relay.forward_message(&payload).await {
                            warn!(message_id = %payload.message_id, error = %e, "inbound forward failed");
                        }
                    }
                    .in_current_span(),
                );
            }
        }
    }

    async fn handle_close(&mut self, reason: CloseReason) {
        self.drop_connection().await;
        if reason.is_terminal() {
            warn!(code = reason.code(), reason = reason.kind(), "connection closed, not retrying");
            self.reconnect_at = None;
            self.set_status(SessionStatus::Disconnected);
            if let Err(e) = self.sync.flush().await {
                warn!(error = %e, "key flush after terminal close failed");
            }
            self.notify(StatusPayload::disconnected(&self.id, reason.kind()));
        } else {
            info!(code = reason.code(), reason = reason.kind(), delay_ms = self.deps.config.reconnect_delay.as_millis() as u64, "connection closed, scheduling reconnect");
            self.set_status(SessionStatus::Reconnecting);
            self.arm_reconnect();
        }
    }

    fn arm_reconnect(&mut self) {
        self.reconnect_at = Some(Instant::now() + self.deps.config.reconnect_delay);
    }

    fn notify(&self, payload: StatusPayload) {
        let relay = self.deps.relay.clone();
        tokio::spawn(
            async move {
                if let Err(e) = relay.notify_status(&payload).await {
                    warn!(error = %e, "status notification failed");
                }
            }
            .in_current_span(),
        );
    }

    /// Move along a lifecycle edge. Returns whether the session is now in `next`.
    fn set_status(&mut self, next: SessionStatus) -> bool {
        let mut snap = self.snapshot.write();
        if snap.status == next {
            return true;
        }
        if !snap.status.can_transition_to(next) {
            warn!(from = %snap.status, to = %next, "ignoring invalid status transition");
            return false;
        }
        debug!(from = %snap.status, to = %next, "status change");
        snap.status = next;
        snap.connected = next == SessionStatus::Connected;
        if next != SessionStatus::Connected {
            snap.phone_number = None;
        }
        if next != SessionStatus::Qr {
            snap.qr = None;
        }
        snap.updated_at = Utc::now();
        true
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<ProtocolEvent>>) -> Option<ProtocolEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
