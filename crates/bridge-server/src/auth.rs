//! Shared-secret authentication for the management routes.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::server::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Reject requests whose `X-API-Key` does not match the configured key.
pub async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let authorized = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|key| state.api_key.matches(key));
    if !authorized {
        tracing::debug!(path = %req.uri().path(), "rejected unauthenticated request");
        return ApiError::Unauthorized.into_response();
    }
    next.run(req).await
}
