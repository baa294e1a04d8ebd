use crate::store::error::StorageError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

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

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
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

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::BucketNotFound(_)
            | StorageError::ObjectNotFound { .. }
            | StorageError::NoSuchUpload(_) => StatusCode::NOT_FOUND,
            StorageError::InvalidBucketName { .. }
            | StorageError::InvalidObjectKey
            | StorageError::InvalidPart { .. }
            | StorageError::PartTooSmall { .. } => StatusCode::BAD_REQUEST,
            StorageError::BucketAlreadyExists(_)
            | StorageError::BucketNotEmpty(_)
            | StorageError::UploadAlreadyExists(_)
            | StorageError::CommitConflict(_) => StatusCode::CONFLICT,
            StorageError::QuotaExceeded => StatusCode::INSUFFICIENT_STORAGE,
            StorageError::RetriesExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            StorageError::IncompatibleSchema(_)
            | StorageError::Inconsistency(_)
            | StorageError::Sqlx(_)
            | StorageError::Io(_)
            | StorageError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {}", err);
        }
        AppError::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_http_status() {
        let cases = [
            (StorageError::NoSuchUpload("u".into()), StatusCode::NOT_FOUND),
            (StorageError::InvalidObjectKey, StatusCode::BAD_REQUEST),
            (StorageError::BucketNotEmpty("b".into()), StatusCode::CONFLICT),
            (StorageError::QuotaExceeded, StatusCode::INSUFFICIENT_STORAGE),
            (
                StorageError::Inconsistency("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }
}
