pub mod address;
pub mod codec;
pub mod errors;
pub mod ids;
pub mod protocol;
pub mod security;
pub mod status;

pub use codec::{CodecError, Material};
pub use errors::{CloseReason, ProtocolError};
pub use ids::{ConnectionId, MessageId, SessionId};
pub use protocol::{
    AuthState, Connection, ConnectionHandle, InboundMessage, KeyMap, MessageContent,
    ProtocolConnector, ProtocolEvent,
};
pub use security::ApiKey;
pub use status::SessionStatus;
