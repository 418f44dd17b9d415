use crate::models::session::SessionStatus;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Domain errors for the upload engine.
///
/// `Validation`, `QuotaExceeded`, `InvalidState` and `Assembly` surface to
/// the caller as 400s with a human-readable reason and are never retried
/// automatically. `Provider`, `Sqlx` and `Io` are backend faults and map
/// to 500.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),
    #[error(
        "storage quota exceeded: {requested} additional bytes over {used} used with a {limit} byte limit"
    )]
    QuotaExceeded {
        used: i64,
        requested: i64,
        limit: i64,
    },
    #[error("session does not belong to the caller")]
    Unauthorized,
    #[error("session not found")]
    NotFound,
    #[error("operation not allowed while session is {0}")]
    InvalidState(SessionStatus),
    #[error("assembly failed: {0}")]
    Assembly(String),
    #[error("path escapes the storage root")]
    PathTraversal,
    #[error("storage provider error: {0}")]
    Provider(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::Validation(_)
            | UploadError::QuotaExceeded { .. }
            | UploadError::InvalidState(_)
            | UploadError::Assembly(_)
            | UploadError::PathTraversal => StatusCode::BAD_REQUEST,
            UploadError::Unauthorized => StatusCode::UNAUTHORIZED,
            UploadError::NotFound => StatusCode::NOT_FOUND,
            UploadError::Provider(_) | UploadError::Sqlx(_) | UploadError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}
