use serde::{Deserialize, Serialize};

/// Connection state of one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    NotStarted,
    Connecting,
    Qr,
    Connected,
    Reconnecting,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Connecting => "connecting",
            Self::Qr => "qr",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
        }
    }

    /// Whether the lifecycle may move from `self` to `next`.
    ///
    /// Close events can arrive from any live state (a pairing challenge can
    /// expire before it is scanned), so `connecting` and `qr` share the close
    /// edges of `connected`. A new challenge replaces the previous one in place.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (NotStarted | Reconnecting | Disconnected, Connecting) => true,
            (Connecting, Qr | Connected) => true,
            (Qr, Qr | Connecting | Connected) => true,
            (Connecting | Qr | Connected, Reconnecting | Disconnected) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
