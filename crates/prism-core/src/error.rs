use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The error taxonomy exposed on the wire. Kinds, not type names: every
/// failure anywhere in the pipeline maps to one of these before it reaches
/// a client or the request row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Authentication,
    Permission,
    NotFound,
    RateLimit,
    Upstream,
    Internal,
    /// Client closed the connection before finalization. Recorded on the
    /// request row, never sent to the (departed) client.
    ClientCancelled,
    /// OAuth refresh failed or upstream rejected our credentials. Surfaces
    /// as a generic upstream error; the root cause stays in the logs.
    UpstreamAuth,
}

impl ErrorKind {
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::InvalidRequest => 400,
            ErrorKind::Authentication => 401,
            ErrorKind::Permission => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::RateLimit => 429,
            ErrorKind::Upstream => 502,
            ErrorKind::Internal => 500,
            ErrorKind::ClientCancelled => 499,
            ErrorKind::UpstreamAuth => 502,
        }
    }

    /// The `type` string inside the `{error:{type,message}}` envelope.
    pub fn wire_type(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request_error",
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::Permission => "permission_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::RateLimit => "rate_limit_error",
            ErrorKind::Upstream => "upstream_error",
            ErrorKind::Internal => "internal_server_error",
            ErrorKind::ClientCancelled => "client_cancelled",
            ErrorKind::UpstreamAuth => "upstream_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum PrismError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Upstream returned 429")]
    RateLimited,

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Upstream authentication failed")]
    UpstreamAuth,

    #[error("Client cancelled")]
    ClientCancelled,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PrismError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PrismError::Config(_) => ErrorKind::Internal,
            PrismError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            PrismError::AuthFailed => ErrorKind::Authentication,
            PrismError::Forbidden(_) => ErrorKind::Permission,
            PrismError::UnknownTenant(_) => ErrorKind::NotFound,
            PrismError::NotFound(_) => ErrorKind::NotFound,
            PrismError::RateLimited => ErrorKind::RateLimit,
            PrismError::Upstream(_) => ErrorKind::Upstream,
            PrismError::UpstreamAuth => ErrorKind::UpstreamAuth,
            PrismError::ClientCancelled => ErrorKind::ClientCancelled,
            PrismError::Database(_) => ErrorKind::Internal,
            PrismError::Serialization(_) => ErrorKind::InvalidRequest,
            PrismError::Io(_) => ErrorKind::Internal,
            PrismError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Wire shape of every error response: `{"error":{"type":..,"message":..}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                error_type: kind.wire_type().to_string(),
                message: crate::redact::redact_secrets(&message.into()),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, PrismError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_contract_statuses() {
        assert_eq!(ErrorKind::Authentication.status(), 401);
        assert_eq!(ErrorKind::NotFound.status(), 404);
        assert_eq!(ErrorKind::RateLimit.status(), 429);
        assert_eq!(ErrorKind::Upstream.status(), 502);
        assert_eq!(ErrorKind::UpstreamAuth.status(), 502);
    }

    #[test]
    fn upstream_auth_is_generic_on_the_wire() {
        // Root cause stays in logs; the wire type must not hint at auth.
        assert_eq!(ErrorKind::UpstreamAuth.wire_type(), "upstream_error");
    }

    #[test]
    fn envelope_serializes_with_type_field() {
        let env = ErrorEnvelope::new(ErrorKind::NotFound, "unknown tenant");
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains(r#""type":"not_found_error""#));
        assert!(json.contains(r#""message":"unknown tenant""#));
    }
}
