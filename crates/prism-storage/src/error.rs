use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists")]
    Conflict,
}

impl From<StorageError> for prism_core::PrismError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(what) => prism_core::PrismError::NotFound(what),
            StorageError::Serialization(e) => prism_core::PrismError::Serialization(e),
            other => prism_core::PrismError::Database(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
