//! Error types for the gateway
//!
//! Model and upload failures get their own enums so workflows can decide
//! whether a failure is fatal. Everything that reaches a handler is folded
//! into [`ApiError`], which renders as `{"detail": "..."}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

/// Failures talking to an inference service
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Invalid model URL: {0}")]
    InvalidUrl(String),

    #[error("Model {0} is disabled")]
    Disabled(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Model service returned error: {status} - {body}")]
    Status { status: u16, body: String },

    #[error("Failed to parse model response: {0}")]
    MalformedResponse(String),

    #[error("Model returned an empty response")]
    EmptyResponse,

    #[error("Model {0} does not accept image input")]
    ImageUnsupported(String),

    #[error("Failed to read image {path}: {source}")]
    ImageRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Rejected or failed upload
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("No filename provided")]
    MissingFilename,

    #[error("File type {0} not allowed")]
    DisallowedExtension(String),

    #[error("File {name} exceeds the {limit_mb} MB limit")]
    TooLarge { name: String, limit_mb: u64 },

    #[error("Failed to store upload: {0}")]
    Io(#[from] std::io::Error),
}

/// Error returned from HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Session not found")]
    SessionNotFound,

    #[error("{0}")]
    PayloadTooLarge(String),

    /// A workflow step that cannot be skipped failed.
    #[error("{0}")]
    Workflow(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::SessionNotFound => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Workflow(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::MissingFilename | UploadError::DisallowedExtension(_) => {
                ApiError::BadRequest(err.to_string())
            }
            UploadError::TooLarge { .. } => ApiError::PayloadTooLarge(err.to_string()),
            UploadError::Io(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        let status = err.status();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(err.body_text())
        } else {
            ApiError::BadRequest(err.body_text())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(serde_json::json!({ "detail": self.to_string() }))).into_response()
    }
}
