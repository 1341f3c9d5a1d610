//! Crate-wide error types.

use thiserror::Error;

use crate::messaging::MessagingError;

/// Top-level error type for the orchestration engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Orchestration error: {0}")]
    Orchestration(String),

    #[error("Docker error: {0}")]
    Docker(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
