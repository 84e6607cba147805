// Ephemeral job HTTP routes
//
// Same SSE framing as session streams, with `event: update` for every item.
// Job history is in memory only; a job that expired or was reset is 404.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::json;

use agentdeck_core::Offset;
use agentdeck_durable::{JobError, JobSubscription};

use super::events::{error_event, resume_offset, SseQuery};
use super::{ApiError, AppState};
use crate::services::{JobUpdate, ServiceError};

#[derive(Debug, Default, Deserialize)]
pub struct StartJobRequest {
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub offset: Offset,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/jobs", post(start_job))
        .route("/v1/jobs/:job_id", delete(reset_job))
        .route("/v1/jobs/:job_id/updates", post(report_update))
        .route("/v1/jobs/:job_id/finish", post(finish_job))
        .route("/v1/jobs/:job_id/sse", get(stream_job_sse))
        .with_state(state)
}

/// POST /v1/jobs
pub async fn start_job(
    State(state): State<AppState>,
    Json(req): Json<StartJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let job_id = state.jobs.start(req.job_id.as_deref())?;
    Ok((StatusCode::CREATED, Json(JobResponse { job_id })))
}

/// POST /v1/jobs/{job_id}/updates
pub async fn report_update(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(update): Json<JobUpdate>,
) -> Result<Json<ReportResponse>, ApiError> {
    let offset = state.jobs.report(&job_id, update)?;
    Ok(Json(ReportResponse { offset }))
}

/// POST /v1/jobs/{job_id}/finish
pub async fn finish_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.jobs.finish(&job_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /v1/jobs/{job_id}
pub async fn reset_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.jobs.reset(&job_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ServiceError::Job(JobError::JobNotFound(job_id)).into())
    }
}

/// GET /v1/jobs/{job_id}/sse
pub async fn stream_job_sse(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<SseQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let from_offset = query
        .from_offset
        .or_else(|| resume_offset(&headers))
        .unwrap_or(0);
    let subscription = state.jobs.subscribe(&job_id, from_offset)?;
    tracing::info!(job_id = %job_id, from_offset, "Starting job stream");

    Ok(Sse::new(job_stream(subscription)).keep_alive(KeepAlive::default()))
}

fn job_stream(
    subscription: JobSubscription<JobUpdate>,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    stream::unfold(Some(subscription), |state| async move {
        let mut subscription = state?;
        match subscription.next().await {
            Some(item) => {
                let event = match SseEvent::default()
                    .event("update")
                    .id(item.offset.to_string())
                    .json_data(&item.item)
                {
                    Ok(event) => event,
                    Err(e) => error_event(&e.to_string()),
                };
                Some((Ok(event), Some(subscription)))
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
