use bridge_core::{ProtocolError, SessionId, SessionStatus};
use bridge_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {session_id} is not connected (status: {status})")]
    NotConnected {
        session_id: SessionId,
        status: SessionStatus,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no stored credentials for {0}")]
    NoCredentials(SessionId),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("session task for {0} has stopped")]
    ChannelClosed(SessionId),

    #[error("{0}")]
    Internal(String),
}

impl SessionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected { .. } => "not_connected",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NoCredentials(_) => "no_credentials",
            Self::Protocol(_) => "protocol",
            Self::Store(_) => "store",
            Self::ChannelClosed(_) => "channel_closed",
            Self::Internal(_) => "internal",
        }
    }
}
