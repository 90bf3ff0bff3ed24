use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("analysis request timed out")]
    Timeout,

    #[error("analysis transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(#[from] prism_storage::StorageError),

    #[error("tokenizer init failed: {0}")]
    Tokenizer(String),

    #[error("conversation has no messages to analyze")]
    EmptyConversation,
}

impl AnalysisError {
    /// Permanent errors skip the retry ladder.
    pub fn is_permanent(&self) -> bool {
        matches!(self, AnalysisError::EmptyConversation)
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
