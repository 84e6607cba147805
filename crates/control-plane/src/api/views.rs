// Materialized view HTTP routes
//
// Read-only and eventually consistent: each request waits briefly for the
// session's projection to reach the stream head seen at request time.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use agentdeck_core::{
    AgentStateView, MessageView, PresenceView, SessionStateView, TerminalLine, ToolCallView,
    WorkflowStepView,
};

use super::{ApiError, AppState, ListResponse};
use crate::services::ServiceError;

/// Projection state of a session and its agents
#[derive(Debug, Serialize)]
pub struct SessionStateResponse {
    pub session: Option<SessionStateView>,
    pub agents: Vec<AgentStateView>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions/:session_id/views/messages", get(get_messages))
        .route("/v1/sessions/:session_id/views/tool_calls", get(get_tool_calls))
        .route("/v1/sessions/:session_id/views/presence", get(get_presence))
        .route("/v1/sessions/:session_id/views/terminal", get(get_terminal))
        .route(
            "/v1/sessions/:session_id/views/workflows/:workflow_id",
            get(get_workflow_steps),
        )
        .route(
            "/v1/sessions/:session_id/views/agents/:agent_id",
            get(get_agent_state),
        )
        .route("/v1/sessions/:session_id/state", get(get_session_state))
        .with_state(state)
}

/// GET /v1/sessions/{session_id}/views/messages
pub async fn get_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ListResponse<MessageView>>, ApiError> {
    Ok(Json(state.views.get_messages(&session_id).await?.into()))
}

/// GET /v1/sessions/{session_id}/views/tool_calls
pub async fn get_tool_calls(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ListResponse<ToolCallView>>, ApiError> {
    Ok(Json(state.views.get_tool_calls(&session_id).await?.into()))
}

/// GET /v1/sessions/{session_id}/views/presence
pub async fn get_presence(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ListResponse<PresenceView>>, ApiError> {
    Ok(Json(state.views.get_presence(&session_id).await?.into()))
}

/// GET /v1/sessions/{session_id}/views/terminal
pub async fn get_terminal(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ListResponse<TerminalLine>>, ApiError> {
    Ok(Json(state.views.get_terminal(&session_id).await?.into()))
}

/// GET /v1/sessions/{session_id}/views/workflows/{workflow_id}
pub async fn get_workflow_steps(
    State(state): State<AppState>,
    Path((session_id, workflow_id)): Path<(String, String)>,
) -> Result<Json<ListResponse<WorkflowStepView>>, ApiError> {
    Ok(Json(
        state
            .views
            .get_workflow_steps(&session_id, &workflow_id)
            .await?
            .into(),
    ))
}

/// GET /v1/sessions/{session_id}/views/agents/{agent_id}
pub async fn get_agent_state(
    State(state): State<AppState>,
    Path((session_id, agent_id)): Path<(String, String)>,
) -> Result<Json<AgentStateView>, ApiError> {
    state
        .views
        .get_agent_state(&session_id, &agent_id)
        .await?
        .map(Json)
        .ok_or_else(|| ServiceError::NotFound(format!("agent {}", agent_id)).into())
}

/// GET /v1/sessions/{session_id}/state
pub async fn get_session_state(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStateResponse>, ApiError> {
    let session = state.views.get_session_state(&session_id).await?;
    let agents = state.views.get_agent_states(&session_id).await?;
    Ok(Json(SessionStateResponse { session, agents }))
}
