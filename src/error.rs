//! Error types for the llama-edge crate.

use llama_engine::EngineError;
use llama_sampling::SamplingError;
use thiserror::Error;

/// Errors from context and stream operations.
///
/// A stream that ends in error keeps a copy of the error, so this type is `Clone`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Prompt too long: {tokens} tokens, {usable} usable")]
    TooLong { tokens: usize, usable: usize },

    #[error("Engine failure: {0}")]
    EngineFailure(#[from] EngineError),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Not ready: {0}")]
    NotReady(String),
}

impl From<SamplingError> for StreamError {
    fn from(err: SamplingError) -> Self {
        match err {
            SamplingError::InvalidParameter(msg) => StreamError::InvalidInput(msg),
            other => StreamError::EngineFailure(EngineError::Inference(other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors from loading configuration files.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(#[from] StreamError),
}
