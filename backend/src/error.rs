use quote_consensus::{DecodeError, ParseKeyError, PipelineError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(#[from] ParseKeyError),

    #[error("Invalid bundle: {0}")]
    InvalidBundle(#[from] DecodeError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Stored data is corrupt: {0}")]
    CorruptRecord(String),

    #[error("Value cannot be stored: {0}")]
    UnstorableValue(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
