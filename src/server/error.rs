//! HTTP error responses for the upload endpoints

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::TusError;
use crate::protocol::{STATUS_CHECKSUM_MISMATCH, STATUS_CONNECTION_INTERRUPTED};
use crate::store::StoreError;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", "Upload not found")
    }

    pub fn gone() -> Self {
        Self::new(StatusCode::GONE, "gone", "Upload is no longer available")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    pub fn unsupported_media_type() -> Self {
        Self::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported_media_type",
            "PATCH requests must use application/offset+octet-stream",
        )
    }

    pub fn too_large(max: u64) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "too_large",
            format!("Upload exceeds the maximum size of {max} bytes"),
        )
    }

    pub fn checksum_mismatch() -> Self {
        Self::new(
            custom_status(STATUS_CHECKSUM_MISMATCH),
            "checksum_mismatch",
            "Checksum of the uploaded content does not match",
        )
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        tracing::error!("Internal error: {}", detail);
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "An internal error occurred",
        )
    }
}

fn custom_status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

impl From<TusError> for ApiError {
    fn from(err: TusError) -> Self {
        match err {
            TusError::File(detail) => {
                tracing::error!("File error: {}", detail);
                Self::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "file_error",
                    "Unable to read or write the upload",
                )
            }
            TusError::Connection(_) => Self::new(
                custom_status(STATUS_CONNECTION_INTERRUPTED),
                "connection_interrupted",
                "Connection interrupted, resume from the last offset",
            ),
            TusError::OutOfRange { .. } => Self::new(
                StatusCode::RANGE_NOT_SATISFIABLE,
                "out_of_range",
                "Upload exceeds its declared length",
            ),
            TusError::Protocol(message) => Self::bad_request(message),
            TusError::ChecksumMismatch { .. } => Self::checksum_mismatch(),
            TusError::Expired(_) => Self::gone(),
            TusError::NotFound(_) => Self::not_found(),
            TusError::Upstream { status, message } => {
                tracing::error!("Upstream error {}: {}", status, message);
                Self::new(StatusCode::BAD_GATEWAY, "upstream_error", "Upstream error")
            }
            TusError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        tracing::error!("Store error: {}", err);
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            "Metadata store error",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.code.to_string(),
            message: self.message,
        });

        (self.status, body).into_response()
    }
}
