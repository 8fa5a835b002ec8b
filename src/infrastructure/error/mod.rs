use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::queue::{QueueError, StoreError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

fn redact(message: String, generic: &str) -> String {
    if is_production() {
        generic.to_string()
    } else {
        message
    }
}

impl AppError {
    /// Status, error code, client message and log message.
    fn parts(&self) -> (StatusCode, &'static str, String, String) {
        let log_message = self.to_string();
        match self {
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIG_ERROR",
                redact(log_message.clone(), "Configuration error"),
                log_message,
            ),
            AppError::Queue(err) => match err {
                QueueError::UnknownQueue(_) => (
                    StatusCode::NOT_FOUND,
                    "UNKNOWN_QUEUE",
                    log_message.clone(),
                    log_message,
                ),
                QueueError::UnknownTask { .. } | QueueError::InvalidPayload(_) => (
                    StatusCode::BAD_REQUEST,
                    "VALIDATION_ERROR",
                    log_message.clone(),
                    log_message,
                ),
                QueueError::ShuttingDown => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SHUTTING_DOWN",
                    log_message.clone(),
                    log_message,
                ),
                QueueError::Store(StoreError::Unavailable(_) | StoreError::Redis(_)) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "STORE_UNAVAILABLE",
                    redact(log_message.clone(), "Service temporarily unavailable"),
                    log_message,
                ),
                QueueError::Store(_) | QueueError::MissingProcessor(_) | QueueError::Config(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    redact(log_message.clone(), "Internal server error"),
                    log_message,
                ),
            },
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                log_message,
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                log_message,
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                redact(log_message.clone(), "Internal server error"),
                log_message,
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, client_message, log_message) = self.parts();

        if status.is_server_error() {
            tracing::error!(
                code = %code,
                status = %status.as_u16(),
                message = %log_message,
                "API error"
            );
        } else {
            tracing::debug!(
                code = %code,
                status = %status.as_u16(),
                message = %log_message,
                "API request rejected"
            );
        }

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
