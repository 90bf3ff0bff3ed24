use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("invalid tenant name: {0}")]
    InvalidTenant(String),

    #[error("client key mismatch for tenant {0}")]
    Forbidden(String),

    #[error("credential file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential file parse error: {0}")]
    Parse(String),

    #[error("OAuth refresh failed: {0}")]
    RefreshFailed(String),

    #[error("OAuth token expired and refresh is failing")]
    Expired,
}

impl From<CredentialError> for prism_core::PrismError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::UnknownTenant(t) => prism_core::PrismError::UnknownTenant(t),
            CredentialError::InvalidTenant(t) => prism_core::PrismError::UnknownTenant(t),
            CredentialError::Forbidden(_) => prism_core::PrismError::AuthFailed,
            CredentialError::RefreshFailed(_) | CredentialError::Expired => {
                prism_core::PrismError::UpstreamAuth
            }
            CredentialError::Io(e) => prism_core::PrismError::Io(e),
            CredentialError::Parse(m) => prism_core::PrismError::Internal(m),
        }
    }
}

pub type Result<T> = std::result::Result<T, CredentialError>;
