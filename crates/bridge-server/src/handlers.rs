//! Route handlers. Each one is a thin translation between HTTP and a
//! [`SessionRegistry`](bridge_engine::SessionRegistry) call.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use bridge_core::{MessageId, SessionId, SessionStatus};
use bridge_engine::SessionSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    pub status: SessionStatus,
    pub connected: bool,
    pub phone_number: Option<String>,
    pub qr: Option<String>,
}

impl From<SessionSnapshot> for StatusBody {
    fn from(snap: SessionSnapshot) -> Self {
        Self {
            status: snap.status,
            connected: snap.connected,
            phone_number: snap.phone_number,
            qr: snap.qr,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub status: SessionStatus,
    pub connected: bool,
    pub phone_number: Option<String>,
    pub has_qr: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<SessionSnapshot> for SessionSummary {
    fn from(snap: SessionSnapshot) -> Self {
        Self {
            has_qr: snap.has_qr(),
            id: snap.id,
            status: snap.status,
            connected: snap.connected,
            phone_number: snap.phone_number,
            updated_at: snap.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub success: bool,
    pub message_id: MessageId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Success {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub sessions: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok".into(),
        sessions: state.registry.len(),
    })
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionList> {
    Json(SessionList {
        sessions: state
            .registry
            .list_all()
            .into_iter()
            .map(SessionSummary::from)
            .collect(),
    })
}

pub async fn start_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<StatusBody>, ApiError> {
    info!(session_id = %id, "start requested");
    let snapshot = state.registry.start(&id).await?;
    Ok(Json(snapshot.into()))
}

pub async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Json<StatusBody> {
    Json(state.registry.status(&id).into())
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Result<Json<SendResponse>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    // Empty fields are left to the session, which reports 409 before 400.
    let message_id = state.registry.send(&id, &req.to, &req.message).await?;
    Ok(Json(SendResponse {
        success: true,
        message_id,
    }))
}

pub async fn disconnect_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<Success>, ApiError> {
    state.registry.disconnect(&id).await?;
    Ok(Json(Success { success: true }))
}

pub async fn logout_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<Success>, ApiError> {
    info!(session_id = %id, "logout requested");
    state.registry.logout(&id).await?;
    Ok(Json(Success { success: true }))
}

pub async fn reset_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Json<StatusBody>, ApiError> {
    info!(session_id = %id, "reset requested");
    let snapshot = state.registry.reset(&id).await?;
    Ok(Json(snapshot.into()))
}
