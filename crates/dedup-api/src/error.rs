use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dedup_core::Error as CoreError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Core(#[from] CoreError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Core(error) => core_status(error),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Config(_) => "internal",
            Self::Core(error) => error.code(),
        }
    }
}

fn core_status(error: &CoreError) -> StatusCode {
    match error {
        CoreError::InvalidState(_)
        | CoreError::SameRecord
        | CoreError::InvalidPage
        | CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        CoreError::NotConnected | CoreError::ReconnectRequired(_) => StatusCode::UNAUTHORIZED,
        CoreError::PlanLimitReached(_) => StatusCode::PAYMENT_REQUIRED,
        CoreError::GroupNotFound(_) | CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::RecordNotInGroup
        | CoreError::GroupsPending(_)
        | CoreError::InvalidPhaseTransition { .. }
        | CoreError::RunNotReady(_) => StatusCode::CONFLICT,
        CoreError::AuthExchangeFailed(_)
        | CoreError::MergeFailed(_)
        | CoreError::Crm(_)
        | CoreError::Http(_) => StatusCode::BAD_GATEWAY,
        CoreError::Database(_)
        | CoreError::LibSql(_)
        | CoreError::Io(_)
        | CoreError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {self}");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        let body = ErrorBody {
            error,
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}
