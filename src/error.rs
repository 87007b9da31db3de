//! Error type shared by the HTTP surface, the ingest path and the worker.
//!
//! Client-input variants map to 4xx responses; everything else is a 500.
use crate::Status;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("File type {extension} not allowed. Allowed types: {allowed}")]
    UnsupportedType { extension: String, allowed: String },

    #[error("File too large. Max size: {max} bytes")]
    TooLarge { max: u64 },

    #[error("Missing or unreadable field: {0}")]
    MissingField(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("{0}")]
    Processing(String),

    #[error("Thumbnail generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Illegal status transition {from} -> {to}")]
    Transition { from: Status, to: Status },

    #[error("Invalid thumbnail set: {0}")]
    InvalidThumbnails(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid_input",
            AppError::UnsupportedType { .. } => "unsupported_type",
            AppError::TooLarge { .. } => "too_large",
            AppError::MissingField(_) => "missing_field",
            AppError::NotFound(_) => "not_found",
            AppError::Storage(_) => "storage_error",
            AppError::Database(_) => "database_error",
            AppError::Queue(_) => "queue_error",
            AppError::Processing(_) | AppError::Timeout(_) => "processing_error",
            AppError::Transition { .. } | AppError::InvalidThumbnails(_) => "state_error",
            AppError::Json(_) | AppError::Internal(_) => "server_error",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    detail: String,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_)
            | AppError::UnsupportedType { .. }
            | AppError::TooLarge { .. } => StatusCode::BAD_REQUEST,
            AppError::MissingField(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        // Storage and database details stay in the logs.
        let detail = if status.is_server_error() {
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        HttpResponse::build(status).json(ErrorBody {
            error: self.kind(),
            detail,
        })
    }
}
