// Session HTTP routes
//
// Creation and lifecycle commands. Every accepted command is recorded on the
// session stream; rejections come back as 409 with the rejection code.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use agentdeck_core::{SessionEvent, SessionLifecycleContext};

use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    /// Generated (UUID v7) when omitted
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub max_participants: Option<u32>,
    #[serde(default)]
    pub idle_timeout_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub context: SessionLifecycleContext,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/:session_id", get(get_session))
        .route("/v1/sessions/:session_id/lifecycle", post(send_session_event))
        .with_state(state)
}

/// POST /v1/sessions
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let session_id = req
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    let max_participants = req
        .max_participants
        .unwrap_or(state.default_max_participants);

    let context = state
        .sessions
        .create(&session_id, max_participants, req.idle_timeout_ms)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            session_id,
            context,
        }),
    ))
}

/// GET /v1/sessions/{session_id}
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let context = state.sessions.get(&session_id).await?;
    Ok(Json(SessionResponse {
        session_id,
        context,
    }))
}

/// POST /v1/sessions/{session_id}/lifecycle - body is a session event,
/// e.g. `{"type": "JOIN", "user_id": "u1", "at": 1700000000000}`
pub async fn send_session_event(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(event): Json<SessionEvent>,
) -> Result<Json<SessionResponse>, ApiError> {
    let context = state.sessions.send(&session_id, event).await?;
    Ok(Json(SessionResponse {
        session_id,
        context,
    }))
}
