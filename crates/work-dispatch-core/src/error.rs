use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid work item: {0}")]
    InvalidItem(String),

    #[error("Invalid priority value: {0}")]
    InvalidPriority(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
