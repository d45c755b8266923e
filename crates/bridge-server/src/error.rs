use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bridge_engine::SessionError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid or missing API key")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Session(e) => match e {
                SessionError::NotConnected { .. } | SessionError::NoCredentials(_) => {
                    StatusCode::CONFLICT
                }
                SessionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                SessionError::Store(_) | SessionError::Protocol(_) => StatusCode::BAD_GATEWAY,
                SessionError::ChannelClosed(_) | SessionError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
