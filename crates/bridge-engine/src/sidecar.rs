//! Protocol connector backed by an external sidecar over websockets.
//!
//! The sidecar owns the messaging network's handshake and encryption. The
//! bridge opens one websocket per session at `{base}/sessions/{id}`, seeds it
//! with stored auth state, and from then on exchanges JSON frames: `op` frames
//! go out, `event` frames come back. Binary values use the credential codec
//! tags in both directions.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bridge_core::{
    AuthState, CloseReason, Connection, ConnectionHandle, ConnectionId, InboundMessage, KeyMap,
    Material, MessageId, ProtocolConnector, ProtocolError, ProtocolEvent, SessionId,
};
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Op<'a> {
    Init {
        creds: Option<&'a Material>,
        keys: &'a KeyMap,
    },
    Send {
        #[serde(rename = "ref")]
        reference: u64,
        to: &'a str,
        text: &'a str,
    },
    Logout,
    Close,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Frame {
    Qr {
        code: String,
    },
    Paired,
    Open {
        me: String,
        #[serde(default, rename = "pushName")]
        push_name: Option<String>,
    },
    Close {
        code: u16,
        #[serde(default)]
        message: String,
    },
    Creds {
        creds: Material,
    },
    Keys {
        #[serde(default)]
        set: KeyMap,
        #[serde(default)]
        delete: Vec<String>,
    },
    Message(InboundMessage),
    Sent {
        #[serde(rename = "ref")]
        reference: u64,
        id: MessageId,
    },
    SendError {
        #[serde(rename = "ref")]
        reference: u64,
        error: String,
    },
}

enum SidecarCommand {
    Send {
        to: String,
        text: String,
        reply: oneshot::Sender<Result<MessageId, ProtocolError>>,
    },
    Logout {
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    Close,
}

pub struct SidecarConnector {
    base_url: Url,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl SidecarConnector {
    pub fn new(
        base_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| ProtocolError::ConnectFailed(format!("invalid sidecar url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ProtocolError::ConnectFailed(format!(
                "{base_url} cannot be a base"
            )));
        }
        Ok(Self {
            base_url,
            connect_timeout,
            request_timeout,
        })
    }

    fn session_url(&self, session_id: &SessionId) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(["sessions", session_id.as_str()]);
        }
        url
    }
}

#[async_trait]
impl ProtocolConnector for SidecarConnector {
    fn name(&self) -> &str {
        "sidecar"
    }

    async fn connect(
        &self,
        session_id: &SessionId,
        auth: AuthState,
        event_buffer: usize,
    ) -> Result<Connection, ProtocolError> {
        let url = self.session_url(session_id);
        let (mut ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ProtocolError::Timeout(self.connect_timeout))?
            .map_err(|e| ProtocolError::ConnectFailed(e.to_string()))?;

        let init = Op::Init {
            creds: auth.credentials.as_ref(),
            keys: &auth.keys,
        };
        send_op(&mut ws, &init).await?;

        let (events_tx, events_rx) = mpsc::channel(event_buffer.max(1));
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let id = ConnectionId::new();
        debug!(session_id = %session_id, connection_id = %id, url = %url, "sidecar connected");
        let task = tokio::spawn(connection_loop(ws, cmd_rx, events_tx));

        Ok(Connection {
            handle: Box::new(SidecarHandle {
                id,
                commands: cmd_tx,
                task,
                request_timeout: self.request_timeout,
            }),
            events: events_rx,
        })
    }
}

async fn send_op(ws: &mut WsStream, op: &Op<'_>) -> Result<(), ProtocolError> {
    let text = serde_json::to_string(op).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| ProtocolError::SendFailed(e.to_string()))
}

fn encode_op(op: &Op<'_>) -> Option<Message> {
    match serde_json::to_string(op) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!(error = %e, "unencodable sidecar op");
            None
        }
    }
}

async fn connection_loop(
    ws: WsStream,
    mut commands: mpsc::Receiver<SidecarCommand>,
    events: mpsc::Sender<ProtocolEvent>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut pending: HashMap<u64, oneshot::Sender<Result<MessageId, ProtocolError>>> =
        HashMap::new();
    let mut next_ref: u64 = 1;

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    SidecarCommand::Send { to, text, reply } => {
                        let reference = next_ref;
                        next_ref += 1;
                        let Some(msg) = encode_op(&Op::Send { reference, to: &to, text: &text }) else {
                            let _ = reply.send(Err(ProtocolError::Malformed("send op".into())));
                            continue;
                        };
                        if let Err(e) = ws_tx.send(msg).await {
                            let _ = reply.send(Err(ProtocolError::SendFailed(e.to_string())));
                            break;
                        }
                        pending.insert(reference, reply);
                    }
                    SidecarCommand::Logout { reply } => {
                        let result = match encode_op(&Op::Logout) {
                            Some(msg) => ws_tx
                                .send(msg)
                                .await
                                .map_err(|e| ProtocolError::SendFailed(e.to_string())),
                            None => Err(ProtocolError::Malformed("logout op".into())),
                        };
                        let _ = reply.send(result);
                    }
                    SidecarCommand::Close => {
                        if let Some(msg) = encode_op(&Op::Close) {
                            let _ = ws_tx.send(msg).await;
                        }
                        let _ = ws_tx.close().await;
                        break;
                    }
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let frame: Frame = match serde_json::from_str(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "unreadable sidecar frame");
                        continue;
                    }
                };
                let event = match frame {
                    Frame::Sent { reference, id } => {
                        if let Some(reply) = pending.remove(&reference) {
                            let _ = reply.send(Ok(id));
                        }
                        continue;
                    }
                    Frame::SendError { reference, error } => {
                        if let Some(reply) = pending.remove(&reference) {
                            let _ = reply.send(Err(ProtocolError::SendFailed(error)));
                        }
                        continue;
                    }
                    Frame::Qr { code } => ProtocolEvent::PairingChallenge { code },
                    Frame::Paired => ProtocolEvent::Paired,
                    Frame::Open { me, push_name } => ProtocolEvent::Open { me, push_name },
                    Frame::Close { code, message } => ProtocolEvent::Closed {
                        reason: CloseReason::from_code(code, message),
                    },
                    Frame::Creds { creds } => ProtocolEvent::CredentialsUpdated { credentials: creds },
                    Frame::Keys { set, delete } => ProtocolEvent::KeysUpdated { set, delete },
                    Frame::Message(msg) => ProtocolEvent::Message(msg),
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
}

struct SidecarHandle {
    id: ConnectionId,
    commands: mpsc::Sender<SidecarCommand>,
    task: JoinHandle<()>,
    request_timeout: Duration,
}

impl SidecarHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, ProtocolError>>) -> SidecarCommand,
    ) -> Result<T, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ProtocolError::Closed)?;
        tokio::time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| ProtocolError::Timeout(self.request_timeout))?
            .map_err(|_| ProtocolError::Closed)?
    }
}

#[async_trait]
impl ConnectionHandle for SidecarHandle {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<MessageId, ProtocolError> {
        self.request(|reply| SidecarCommand::Send {
            to: to.to_string(),
            text: text.to_string(),
            reply,
        })
        .await
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.request(|reply| SidecarCommand::Logout { reply }).await
    }

    async fn terminate(&self) {
        if self.commands.send(SidecarCommand::Close).await.is_err() {
            return;
        }
        if tokio::time::timeout(Duration::from_secs(2), self.commands.closed())
            .await
            .is_err()
        {
            self.task.abort();
        }
    }
}

impl Drop for SidecarHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
