//! Model lifecycle error taxonomy
//!
//! Construction-time validation errors surface synchronously from
//! `Model::new`; load-time errors surface from `await_ready`/`predict`.
//! Generation-time failures never raise; they become terminal deltas.

use thiserror::Error;

use crate::inference::engine::EngineError;

#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// The resolved local model path does not exist or is not a model file
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Engine construction failed or returned no instance
    #[error("model failed to load: {0}")]
    FailedToLoad(String),

    /// The readiness wait exceeded the configured timeout
    #[error("model took too long to load: {0}")]
    TookTooLongToLoad(String),

    /// Reserved for unrecognized model families; part of the contract
    #[error("model type not supported: {0}")]
    TypeNotSupported(String),
}

impl From<EngineError> for ModelError {
    fn from(e: EngineError) -> Self {
        ModelError::FailedToLoad(e.to_string())
    }
}
