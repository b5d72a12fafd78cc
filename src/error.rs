//! Error types for the fieldsync server

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::sync::SyncError;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Sync(e) => sync_error_parts(e),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "storage_unavailable",
                    "Storage is unavailable, retry later".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}

fn sync_error_parts(e: &SyncError) -> (StatusCode, &'static str, String) {
    match e {
        SyncError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
        SyncError::InvalidState(msg) => (StatusCode::CONFLICT, "invalid_state", msg.clone()),
        SyncError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
        SyncError::Storage(inner) => {
            tracing::error!("Storage error: {}", inner);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                "Storage is unavailable, retry later".to_string(),
            )
        }
        SyncError::Contention(entity) => {
            tracing::warn!("Write contention on {}", entity);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "contention",
                format!("Entity {} is busy, retry later", entity),
            )
        }
        SyncError::Corrupt(msg) => {
            tracing::error!("Corrupt record: {}", msg);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An internal error occurred".to_string(),
            )
        }
    }
}
