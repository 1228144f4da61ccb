//! Mapping of lifecycle errors onto HTTP responses.

use arena_core::ArenaError;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<String>,
}

/// Error returned by every handler.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
                current_status: None,
            },
        }
    }

    fn with_current_status(mut self, current_status: Option<String>) -> Self {
        self.body.current_status = current_status;
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "missing or wrong webhook secret",
        )
    }

    /// The review gate reports both of its refusals as validation errors.
    pub fn from_continue(err: ArenaError) -> Self {
        match err {
            ArenaError::InvalidStatus { .. } | ArenaError::IterationLimitReached { .. } => {
                let current_status = err.current_status();
                Self::validation(err.to_string()).with_current_status(current_status)
            }
            other => other.into(),
        }
    }
}

impl From<ArenaError> for ApiError {
    fn from(err: ArenaError) -> Self {
        let status = match &err {
            ArenaError::NotFound { .. } => StatusCode::NOT_FOUND,
            ArenaError::InvalidStatus { .. }
            | ArenaError::InvalidTransition { .. }
            | ArenaError::IterationLimitReached { .. }
            | ArenaError::Validation(_) => StatusCode::BAD_REQUEST,
            ArenaError::ConcurrentModification { .. } => StatusCode::CONFLICT,
            ArenaError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ArenaError::Storage(e) => {
                error!(error = %e, "storage failure");
                return Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "internal storage error",
                );
            }
        };
        let current_status = err.current_status();
        Self::new(status, err.code(), err.to_string()).with_current_status(current_status)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::validation(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Parse a path id, answering `INVALID_UUID` on garbage.
pub fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "INVALID_UUID",
            format!("{raw:?} is not a valid UUID"),
        )
    })
}
