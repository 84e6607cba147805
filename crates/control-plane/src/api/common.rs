// Common DTOs for the public API
//
// These types are shared across multiple API endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use agentdeck_durable::{BrokerError, JobError, LogError};

use crate::services::ServiceError;

/// Standard error response for API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong.
    pub error: String,
    /// Stable machine-readable code, set for lifecycle rejections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Convert to axum response tuple
    pub fn into_response(self, status: StatusCode) -> (StatusCode, Json<Self>) {
        (status, Json(self))
    }
}

/// Response wrapper for list endpoints.
/// All list endpoints return responses wrapped in a `data` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// Service error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::AlreadyExists(_) => StatusCode::CONFLICT,
            ServiceError::Invalid(_) => StatusCode::BAD_REQUEST,
            ServiceError::Rejected { .. } => StatusCode::CONFLICT,
            ServiceError::Broker(err) => match err {
                BrokerError::SubscriberLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
                BrokerError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
                BrokerError::Log(LogError::StreamNotFound(_)) => StatusCode::NOT_FOUND,
                BrokerError::Log(LogError::StreamAlreadyExists(_))
                | BrokerError::Log(LogError::StreamClosed(_)) => StatusCode::CONFLICT,
                BrokerError::Log(LogError::ChannelNotAllowed { .. }) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ServiceError::Job(err) => match err {
                JobError::JobNotFound(_) => StatusCode::NOT_FOUND,
                JobError::JobAlreadyExists(_) | JobError::JobFinished(_) => StatusCode::CONFLICT,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        let mut body = ErrorResponse::new(self.0.to_string());
        if let ServiceError::Rejected { code, .. } = &self.0 {
            body = body.with_code(code.as_str());
        }
        ErrorResponse::into_response(body, status).into_response()
    }
}
