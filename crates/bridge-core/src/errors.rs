use serde::{Deserialize, Serialize};

/// Why the messaging network closed a connection.
/// Classifies causes as terminal (never auto-retried) or retryable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CloseReason {
    // Terminal: the network revoked the session
    #[error("logged out")]
    LoggedOut,
    #[error("access forbidden")]
    Forbidden,
    #[error("incompatible protocol version")]
    ProtocolMismatch,

    // Retryable
    #[error("connection lost")]
    ConnectionLost,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection replaced")]
    ConnectionReplaced,
    #[error("bad session")]
    BadSession,
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("restart required")]
    RestartRequired,
    #[error("closed with code {code}: {message}")]
    Other { code: u16, message: String },
}

impl CloseReason {
    /// Map a numeric disconnect code from the network.
    pub fn from_code(code: u16, message: impl Into<String>) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            411 => Self::ProtocolMismatch,
            408 => Self::ConnectionLost,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::ServiceUnavailable,
            515 => Self::RestartRequired,
            _ => Self::Other {
                code,
                message: message.into(),
            },
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::LoggedOut => 401,
            Self::Forbidden => 403,
            Self::ProtocolMismatch => 411,
            Self::ConnectionLost => 408,
            Self::ConnectionClosed => 428,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::ServiceUnavailable => 503,
            Self::RestartRequired => 515,
            Self::Other { code, .. } => *code,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut | Self::Forbidden | Self::ProtocolMismatch)
    }

    pub fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }

    /// Short classification string for logging and the status webhook.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LoggedOut => "logged_out",
            Self::Forbidden => "forbidden",
            Self::ProtocolMismatch => "protocol_mismatch",
            Self::ConnectionLost => "connection_lost",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionReplaced => "connection_replaced",
            Self::BadSession => "bad_session",
            Self::ServiceUnavailable => "service_unavailable",
            Self::RestartRequired => "restart_required",
            Self::Other { .. } => "other",
        }
    }
}

/// Failures raised by a protocol client while connecting or sending.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("connection closed")]
    Closed,
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),
    #[error("malformed frame: {0}")]
    Malformed(String),
}
