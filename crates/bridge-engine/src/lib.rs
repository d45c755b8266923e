//! Session management for the messaging bridge.
//!
//! [`SessionRegistry`] maps session ids to actors that each own one protocol
//! connection, its pairing and reconnect lifecycle, and the credential sync for
//! that session. Inbound messages and status transitions leave through a
//! [`Relay`].

pub mod error;
pub mod lifecycle;
pub mod mock;
pub mod qr;
pub mod registry;
pub mod relay;
pub mod restore;
pub mod sidecar;

pub use error::SessionError;
pub use lifecycle::{SessionConfig, SessionDeps, SessionSnapshot, StartMode};
pub use mock::{MockConnector, RecordingRelay};
pub use registry::SessionRegistry;
pub use relay::{HttpRelay, InboundPayload, Relay, StatusEvent, StatusPayload};
pub use restore::{restore_sessions, spawn_restore, RestoreReport};
pub use sidecar::SidecarConnector;
