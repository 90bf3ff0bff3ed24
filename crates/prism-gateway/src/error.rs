//! Maps internal errors onto the wire taxonomy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use prism_core::{ErrorEnvelope, ErrorKind, PrismError};

/// Handler-level error: a taxonomy kind plus a client-safe message. The
/// envelope constructor redacts secrets as a last line of defense.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn authentication() -> Self {
        Self::new(ErrorKind::Authentication, "invalid or missing bearer token")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal() -> Self {
        Self::new(ErrorKind::Internal, "internal server error")
    }
}

impl From<PrismError> for ApiError {
    fn from(e: PrismError) -> Self {
        let kind = e.kind();
        // Internal details never reach the wire for 5xx kinds.
        let message = match kind {
            ErrorKind::Internal => "internal server error".to_string(),
            ErrorKind::UpstreamAuth => "upstream request failed".to_string(),
            _ => e.to_string(),
        };
        Self { kind, message }
    }
}

impl From<prism_storage::StorageError> for ApiError {
    fn from(e: prism_storage::StorageError) -> Self {
        ApiError::from(prism_core::PrismError::from(e))
    }
}

impl From<prism_credentials::CredentialError> for ApiError {
    fn from(e: prism_credentials::CredentialError) -> Self {
        ApiError::from(prism_core::PrismError::from(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.kind.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let envelope = ErrorEnvelope::new(self.kind, self.message);
        (status, Json(envelope)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
