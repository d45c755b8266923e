//! Forwarding of inbound messages and status transitions to the backend.
//!
//! Relay is best effort. Callers log failures and move on; nothing here is
//! retried or allowed to stall a session.

use async_trait::async_trait;
use bridge_core::{address, InboundMessage, MessageId, SessionId};
use bridge_store::{BackendClient, StoreError};
use reqwest::Method;
use serde::{Deserialize, Serialize};

/// Normalized inbound message in the backend's webhook shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundPayload {
    pub user_id: SessionId,
    /// Sender with network suffixes stripped.
    pub from: String,
    /// Full sender address, usable as a reply target.
    pub from_jid: String,
    pub from_name: String,
    pub message: String,
    pub message_id: MessageId,
    pub timestamp: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusEvent {
    Connected,
    Disconnected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub user_id: SessionId,
    pub event: StatusEvent,
    pub phone_number: Option<String>,
    pub reason: Option<String>,
}

impl StatusPayload {
    pub fn connected(session_id: &SessionId, phone_number: &str) -> Self {
        Self {
            user_id: session_id.clone(),
            event: StatusEvent::Connected,
            phone_number: Some(phone_number.to_string()),
            reason: None,
        }
    }

    pub fn disconnected(session_id: &SessionId, reason: &str) -> Self {
        Self {
            user_id: session_id.clone(),
            event: StatusEvent::Disconnected,
            phone_number: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// Outbound side of the relay.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn forward_message(&self, payload: &InboundPayload) -> Result<(), StoreError>;

    async fn notify_status(&self, payload: &StatusPayload) -> Result<(), StoreError>;
}

/// Turn a protocol message into a webhook payload, or `None` when it should not
/// be relayed: own messages, group and broadcast traffic, and messages without
/// any text.
pub fn normalize_inbound(session_id: &SessionId, msg: &InboundMessage) -> Option<InboundPayload> {
    if msg.from_me || address::is_group(&msg.remote_jid) || address::is_broadcast(&msg.remote_jid)
    {
        return None;
    }
    let text = msg.content.extract_text()?;
    let from = address::user_part(&msg.remote_jid).to_string();
    if from.is_empty() {
        return None;
    }
    let from_name = msg
        .push_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map_or_else(|| from.clone(), str::to_string);

    Some(InboundPayload {
        user_id: session_id.clone(),
        from,
        from_jid: msg.remote_jid.clone(),
        from_name,
        message: text.to_string(),
        message_id: msg.id.clone(),
        timestamp: msg.timestamp,
    })
}

/// Posts to the backend's `/webhook` endpoints.
pub struct HttpRelay {
    client: BackendClient,
}

impl HttpRelay {
    pub fn new(client: BackendClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Relay for HttpRelay {
    async fn forward_message(&self, payload: &InboundPayload) -> Result<(), StoreError> {
        self.client
            .send_json(Method::POST, &["webhook", "message"], payload)
            .await
    }

    async fn notify_status(&self, payload: &StatusPayload) -> Result<(), StoreError> {
        self.client
            .send_json(Method::POST, &["webhook", "status"], payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bridge_core::{ApiKey, MessageContent};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn message(jid: &str, content: MessageContent) -> InboundMessage {
        InboundMessage {
            id: MessageId::from_raw("3EB0A1"),
            remote_jid: jid.into(),
            from_me: false,
            push_name: Some("Asha".into()),
            timestamp: 1_700_000_000,
            content,
        }
    }

    fn sid() -> SessionId {
        SessionId::from_raw("u1")
    }

    #[test]
    fn normalizes_sender_and_text() {
        let msg = message("919876543210@s.whatsapp.net", MessageContent::text("hello"));
        let payload = normalize_inbound(&sid(), &msg).unwrap();
        assert_eq!(payload.from, "919876543210");
        assert_eq!(payload.from_jid, "919876543210@s.whatsapp.net");
        assert_eq!(payload.from_name, "Asha");
        assert_eq!(payload.message, "hello");
    }

    #[test]
    fn caption_is_used_when_no_plain_text() {
        let content = MessageContent {
            document_caption: Some("invoice attached".into()),
            ..Default::default()
        };
        let payload = normalize_inbound(&sid(), &message("1@s.whatsapp.net", content)).unwrap();
        assert_eq!(payload.message, "invoice attached");
    }

    #[test]
    fn skips_own_group_broadcast_and_empty() {
        let mut own = message("1@s.whatsapp.net", MessageContent::text("x"));
        own.from_me = true;
        assert!(normalize_inbound(&sid(), &own).is_none());

        let group = message("120363@g.us", MessageContent::text("x"));
        assert!(normalize_inbound(&sid(), &group).is_none());

        let status = message("status@broadcast", MessageContent::text("x"));
        assert!(normalize_inbound(&sid(), &status).is_none());

        let empty = message("1@s.whatsapp.net", MessageContent::default());
        assert!(normalize_inbound(&sid(), &empty).is_none());
    }

    #[test]
    fn from_name_falls_back_to_sender() {
        let mut msg = message("919876543210:2@s.whatsapp.net", MessageContent::text("hi"));
        msg.push_name = Some("  ".into());
        let payload = normalize_inbound(&sid(), &msg).unwrap();
        assert_eq!(payload.from_name, "919876543210");
    }

    async fn relay(server: &MockServer) -> HttpRelay {
        let client =
            BackendClient::new(&server.uri(), ApiKey::new("secret"), Duration::from_secs(5)).unwrap();
        HttpRelay::new(client)
    }

    #[tokio::test]
    async fn forwards_message_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook/message"))
            .and(header("X-API-Key", "secret"))
            .and(body_json(json!({
                "userId": "u1",
                "from": "919876543210",
                "fromJid": "919876543210@s.whatsapp.net",
                "fromName": "Asha",
                "message": "hello",
                "messageId": "3EB0A1",
                "timestamp": 1_700_000_000
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let msg = message("919876543210@s.whatsapp.net", MessageContent::text("hello"));
        let payload = normalize_inbound(&sid(), &msg).unwrap();
        relay(&server).await.forward_message(&payload).await.unwrap();
    }

    #[tokio::test]
    async fn posts_status_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook/status"))
            .and(body_json(json!({
                "userId": "u1",
                "event": "connected",
                "phoneNumber": "919876543210",
                "reason": null
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        relay(&server)
            .await
            .notify_status(&StatusPayload::connected(&sid(), "919876543210"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backend_errors_surface_to_caller() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = relay(&server)
            .await
            .notify_status(&StatusPayload::disconnected(&sid(), "logged_out"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Status { status: 500, .. }));
    }
}
