//! Protocol-client abstraction.
//!
//! The messaging network's handshake and encryption live behind
//! [`ProtocolConnector`]. A connector opens one [`Connection`] per session: a
//! handle for outbound calls plus a bounded channel of typed [`ProtocolEvent`]s
//! consumed by the session's owning task.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::codec::Material;
use crate::errors::{CloseReason, ProtocolError};
use crate::ids::{ConnectionId, MessageId, SessionId};

/// Key records by composite key `"{type}:{id}"`.
pub type KeyMap = BTreeMap<String, Material>;

/// Durable authentication state a connection is seeded with.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuthState {
    pub credentials: Option<Material>,
    pub keys: KeyMap,
}

impl AuthState {
    pub fn new(credentials: Option<Material>, keys: KeyMap) -> Self {
        Self { credentials, keys }
    }

    /// Paired credentials carry the network-assigned identity under `me`.
    pub fn has_credentials(&self) -> bool {
        self.credentials.as_ref().is_some_and(has_identity)
    }
}

/// Whether a credential blob carries a network-assigned identity.
pub fn has_identity(credentials: &Material) -> bool {
    credentials.get("me").is_some_and(|me| !me.is_null())
}

/// The message shapes text can arrive in. At most a few are populated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageContent {
    pub conversation: Option<String>,
    pub extended_text: Option<String>,
    pub image_caption: Option<String>,
    pub video_caption: Option<String>,
    pub document_caption: Option<String>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            conversation: Some(text.into()),
            ..Default::default()
        }
    }

    /// First non-empty text, in shape priority order.
    pub fn extract_text(&self) -> Option<&str> {
        [
            &self.conversation,
            &self.extended_text,
            &self.image_caption,
            &self.video_caption,
            &self.document_caption,
        ]
        .into_iter()
        .filter_map(|s| s.as_deref())
        .find(|s| !s.trim().is_empty())
    }
}

/// A message as delivered by the protocol layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: MessageId,
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub push_name: Option<String>,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub content: MessageContent,
}

/// Events emitted by a live connection.
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolEvent {
    /// A fresh pairing code to be shown as a QR image.
    PairingChallenge { code: String },
    /// The pairing code was scanned; the handshake continues.
    Paired,
    /// Authenticated and open. `me` is the own-account address.
    Open { me: String, push_name: Option<String> },
    Closed { reason: CloseReason },
    /// The full current credential blob.
    CredentialsUpdated { credentials: Material },
    /// Key records to upsert and composite keys to delete.
    KeysUpdated { set: KeyMap, delete: Vec<String> },
    Message(InboundMessage),
}

impl ProtocolEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PairingChallenge { .. } => "pairing_challenge",
            Self::Paired => "paired",
            Self::Open { .. } => "open",
            Self::Closed { .. } => "closed",
            Self::CredentialsUpdated { .. } => "credentials_updated",
            Self::KeysUpdated { .. } => "keys_updated",
            Self::Message(_) => "message",
        }
    }
}

/// Outbound side of one live connection.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    fn id(&self) -> &ConnectionId;

    /// Send a text message to a full address.
    async fn send_text(&self, to: &str, text: &str) -> Result<MessageId, ProtocolError>;

    /// Unlink this device from the account.
    async fn logout(&self) -> Result<(), ProtocolError>;

    /// Close the connection. No further events are delivered.
    async fn terminate(&self);
}

/// A freshly opened connection.
pub struct Connection {
    pub handle: Box<dyn ConnectionHandle>,
    pub events: mpsc::Receiver<ProtocolEvent>,
}

/// Creates protocol connections.
#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    fn name(&self) -> &str;

    /// Open a connection seeded with `auth`. Empty credentials mean the
    /// client initializes fresh ones and starts pairing.
    async fn connect(
        &self,
        session_id: &SessionId,
        auth: AuthState,
        event_buffer: usize,
    ) -> Result<Connection, ProtocolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_credentials_requires_identity() {
        assert!(!AuthState::default().has_credentials());

        let unpaired = Material::map([("noiseKey", Material::binary(vec![1u8; 32]))]);
        assert!(!AuthState::new(Some(unpaired), KeyMap::new()).has_credentials());

        let null_me = Material::map([("me", Material::Null)]);
        assert!(!AuthState::new(Some(null_me), KeyMap::new()).has_credentials());

        let paired = Material::map([("me", Material::map([("id", Material::from("1@s.whatsapp.net"))]))]);
        assert!(AuthState::new(Some(paired), KeyMap::new()).has_credentials());
    }

    #[test]
    fn extract_text_priority() {
        let content = MessageContent {
            conversation: None,
            extended_text: Some("extended".into()),
            image_caption: Some("caption".into()),
            ..Default::default()
        };
        assert_eq!(content.extract_text(), Some("extended"));
    }

    #[test]
    fn extract_text_skips_empty_shapes() {
        let content = MessageContent {
            conversation: Some("".into()),
            extended_text: Some("   ".into()),
            video_caption: Some("clip".into()),
            ..Default::default()
        };
        assert_eq!(content.extract_text(), Some("clip"));
        assert_eq!(MessageContent::default().extract_text(), None);
    }

    #[test]
    fn inbound_message_from_camel_case_json() {
        let msg: InboundMessage = serde_json::from_value(serde_json::json!({
            "id": "3EB0C1",
            "remoteJid": "919876543210@s.whatsapp.net",
            "pushName": "Asha",
            "timestamp": 1700000000,
            "content": {"imageCaption": "invoice"}
        }))
        .unwrap();
        assert!(!msg.from_me);
        assert_eq!(msg.content.extract_text(), Some("invoice"));
    }
}
