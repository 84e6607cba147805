// Agent HTTP routes
//
// Agents are registered on a session and driven by lifecycle events. Output
// (chunks, tool calls) is posted through the agent so it is attributed to a
// registered agent.

use std::collections::BTreeSet;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use agentdeck_core::{AgentEvent, AgentLifecycleContext, Channel, Event, EventPayload};

use super::{ApiError, AppState};
use crate::services::ServiceError;

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    /// Generated (UUID v7) when omitted
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    pub allowed_tools: BTreeSet<String>,
}

#[derive(Debug, Serialize)]
pub struct AgentResponse {
    pub agent_id: String,
    pub context: AgentLifecycleContext,
}

/// Agent output: a channel name and its payload
#[derive(Debug, Deserialize)]
pub struct AgentOutputRequest {
    pub channel: String,
    pub payload: serde_json::Value,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions/:session_id/agents", post(register_agent))
        .route("/v1/sessions/:session_id/agents/:agent_id", get(get_agent))
        .route(
            "/v1/sessions/:session_id/agents/:agent_id/lifecycle",
            post(send_agent_event),
        )
        .route(
            "/v1/sessions/:session_id/agents/:agent_id/output",
            post(emit_output),
        )
        .with_state(state)
}

/// POST /v1/sessions/{session_id}/agents
pub async fn register_agent(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<RegisterAgentRequest>,
) -> Result<(StatusCode, Json<AgentResponse>), ApiError> {
    let agent_id = req
        .agent_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    let max_turns = req.max_turns.unwrap_or(state.default_max_turns);

    let context = state
        .agents
        .register(&session_id, &agent_id, max_turns, req.allowed_tools)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(AgentResponse { agent_id, context }),
    ))
}

/// GET /v1/sessions/{session_id}/agents/{agent_id}
pub async fn get_agent(
    State(state): State<AppState>,
    Path((session_id, agent_id)): Path<(String, String)>,
) -> Result<Json<AgentResponse>, ApiError> {
    let context = state.agents.get(&session_id, &agent_id).await?;
    Ok(Json(AgentResponse { agent_id, context }))
}

/// POST /v1/sessions/{session_id}/agents/{agent_id}/lifecycle - body is an
/// agent event, e.g. `{"type": "STEP", "tool": "bash"}`
pub async fn send_agent_event(
    State(state): State<AppState>,
    Path((session_id, agent_id)): Path<(String, String)>,
    Json(event): Json<AgentEvent>,
) -> Result<Json<AgentResponse>, ApiError> {
    let context = state.agents.send(&session_id, &agent_id, event).await?;
    Ok(Json(AgentResponse { agent_id, context }))
}

/// POST /v1/sessions/{session_id}/agents/{agent_id}/output - chunk, tool
/// call or terminal output produced by the agent
pub async fn emit_output(
    State(state): State<AppState>,
    Path((session_id, agent_id)): Path<(String, String)>,
    Json(req): Json<AgentOutputRequest>,
) -> Result<(StatusCode, Json<Event>), ApiError> {
    let channel = Channel::parse(&req.channel);
    if !matches!(channel, Channel::Chunk | Channel::ToolCall | Channel::Terminal) {
        return Err(ServiceError::Invalid(format!(
            "agents cannot write channel '{}'",
            req.channel
        ))
        .into());
    }
    let payload = EventPayload::decode(channel, &req.payload)
        .map_err(|e| ServiceError::Invalid(e.to_string()))?;

    let event = state.agents.emit(&session_id, &agent_id, payload).await?;
    Ok((StatusCode::CREATED, Json(event)))
}
