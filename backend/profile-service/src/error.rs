use crate::services::aggregator::AggregateError;
use processing_state::ProcessingStateError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// Hard failures. Expected control-flow outcomes (admission conflict, missing
/// profile, unembeddable input) are reported through outcome enums instead.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Embedding provider error: {0}")]
    Embedding(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Aggregation failed: {0}")]
    Aggregate(#[from] AggregateError),

    #[error("Processing state error: {0}")]
    ProcessingState(#[from] ProcessingStateError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
