use thiserror::Error;

/// Volstow error types
#[derive(Error, Debug)]
pub enum VolError {
    /// Bad configuration document or missing required field
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed document: invalid JSON, missing or duplicate manifest annotation
    #[error("Format error: {0}")]
    Format(String),

    /// Failure reported by a blob store or registry
    #[error("Storage error: {0}")]
    Storage(String),

    /// Operation on a collection in an invalid state
    #[error("State error: {0}")]
    State(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for VolError {
    fn from(err: serde_json::Error) -> Self {
        VolError::Serialization(err.to_string())
    }
}

/// Result type alias for Volstow operations
pub type Result<T> = std::result::Result<T, VolError>;
