// Event streaming HTTP routes (SSE)
//
// SSE framing: `event:` is the channel, `id:` the stream offset and `data:`
// the full Event JSON. A `done` event marks a clean end (stream closed and
// drained); an `error` event marks a failure. Clients reconnect with
// `Last-Event-ID` (or `from_offset`) and resume after the last offset seen.
// When the client disconnects axum drops the stream, which drops the
// subscription and releases its slot.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;

use agentdeck_core::{Event, Offset};
use agentdeck_durable::Subscription;

use super::{ApiError, AppState};
use crate::services::EventPage;

/// Query parameters for event listing
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// First offset to return (default 0)
    pub from_offset: Option<Offset>,
    /// Page size, capped server side
    pub limit: Option<usize>,
}

/// Query parameters for SSE
#[derive(Debug, Deserialize)]
pub struct SseQuery {
    /// First offset to stream; takes precedence over `Last-Event-ID`
    pub from_offset: Option<Offset>,
}

/// Request body for client-produced events
#[derive(Debug, Deserialize)]
pub struct AppendEventRequest {
    pub channel: String,
    pub payload: serde_json::Value,
}

// ============================================
// Routes
// ============================================

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions/:session_id/sse", get(stream_sse))
        .route(
            "/v1/sessions/:session_id/events",
            get(list_events).post(append_event),
        )
        .with_state(state)
}

// ============================================
// HTTP Handlers
// ============================================

/// GET /v1/sessions/{session_id}/sse - Replay then follow the session stream
pub async fn stream_sse(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<SseQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let from_offset = query
        .from_offset
        .or_else(|| resume_offset(&headers))
        .unwrap_or(0);

    let subscription = state.events.subscribe(&session_id, from_offset).await?;
    tracing::info!(session_id = %session_id, from_offset, "Starting event stream");

    Ok(Sse::new(sse_stream(subscription)).keep_alive(KeepAlive::default()))
}

/// GET /v1/sessions/{session_id}/events - One page of events (JSON)
pub async fn list_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventPage>, ApiError> {
    let page = state
        .events
        .list(&session_id, query.from_offset.unwrap_or(0), query.limit)
        .await?;
    Ok(Json(page))
}

/// POST /v1/sessions/{session_id}/events - Append a client event
/// (presence, terminal, workflow)
pub async fn append_event(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<AppendEventRequest>,
) -> Result<(StatusCode, Json<Event>), ApiError> {
    let event = state
        .events
        .emit(&session_id, &req.channel, req.payload)
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}

// ============================================
// SSE framing
// ============================================

/// Offset after the one named by `Last-Event-ID`
pub(crate) fn resume_offset(headers: &HeaderMap) -> Option<Offset> {
    headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<Offset>().ok())
        .and_then(|offset| offset.checked_add(1))
}

pub(crate) fn error_event(message: &str) -> SseEvent {
    SseEvent::default()
        .event("error")
        .data(json!({ "error": message }).to_string())
}

fn event_to_sse(event: &Event) -> SseEvent {
    match serde_json::to_string(event) {
        Ok(data) => SseEvent::default()
            .event(event.channel.as_str())
            .data(data)
            .id(event.offset.to_string()),
        Err(e) => error_event(&format!("failed to encode event {}: {}", event.offset, e)),
    }
}

/// Subscription as SSE events, terminated by `done` or `error`
fn sse_stream(subscription: Subscription) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    stream::unfold(Some(subscription), |state| async move {
        let mut subscription = state?;
        match subscription.next().await {
            Some(Ok(event)) => Some((Ok(event_to_sse(&event)), Some(subscription))),
            Some(Err(e)) => {
                tracing::error!(
                    stream_id = %subscription.stream_id(),
                    cursor = subscription.cursor(),
                    error = %e,
                    "Event stream failed"
                );
                Some((Ok(error_event(&e.to_string())), None))
            }
            None => {
                let done = SseEvent::default()
                    .event("done")
                    .data(json!({ "next_offset": subscription.cursor() }).to_string());
                Some((Ok(done), None))
            }
        }
    })
}
