use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::{AppError, ErrorClass};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Work queue is full")]
    QueueFull,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{class}: {message}")]
    Classified { class: ErrorClass, message: String },

    #[error("Internal server error")]
    Internal(String),
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Validation(msg) => Self::Validation(msg),
            AppError::QueueFull => Self::QueueFull,
            AppError::NotFound(msg) => Self::NotFound(msg),
            AppError::Database(_) | AppError::Io(_) | AppError::InternalError(_) => {
                tracing::error!("Internal error: {:?}", err);
                Self::Internal(err.to_string())
            }
            other => Self::Classified {
                class: other.classify(),
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Validation(reason) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "rejected", "reason": reason })),
            )
                .into_response(),
            Self::QueueFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "rejected", "reason": "queue_full" })),
            )
                .into_response(),
            Self::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    status: "error".to_string(),
                    error: message,
                    class: None,
                }),
            )
                .into_response(),
            Self::Classified { class, message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    status: "error".to_string(),
                    error: message,
                    class: Some(class.to_string()),
                }),
            )
                .into_response(),
            Self::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    status: "error".to_string(),
                    error: "Internal server error".to_string(),
                    class: None,
                }),
            )
                .into_response(),
        }
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    status: String,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    class: Option<String>,
}
