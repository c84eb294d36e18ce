use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Failure taxonomy of the matching kernel.
///
/// `NotLive` is not an error: cancel of an unknown or terminal order is a
/// normal `false` return.
#[derive(Debug, Error)]
pub(crate) enum EngineError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("storage: {0}")]
    Storage(#[from] sqlx::Error),

    /// The caller's deadline fired before the engine replied. A command that
    /// was already enqueued still runs to completion.
    #[error("deadline exceeded")]
    Deadline,

    #[error("engine unavailable")]
    Unavailable,

    /// A state transition that must never happen (e.g. remaining would go
    /// negative). The offending command is refused and never committed.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    pub(crate) detail: String,
}

#[derive(Debug)]
pub(crate) struct ApiError {
    pub(crate) status: StatusCode,
    pub(crate) detail: String,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, value.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(value: EngineError) -> Self {
        let status = match &value {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::Deadline => StatusCode::GATEWAY_TIMEOUT,
            EngineError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Storage(_) | EngineError::Invariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, value.to_string())
    }
}
