//! HTTP management API for the session registry.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod server;

pub use auth::API_KEY_HEADER;
pub use error::ApiError;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
