//! Model lifecycle, native engine, and prediction pipeline.

pub mod engine;
pub mod error;
pub mod gguf;
pub mod model;
pub mod pipeline;

pub use engine::{ChatEvent, EngineError, LlamaEngine, LoadSpec};
pub use error::ModelError;
pub use gguf::{validate_gguf, GgufError, GgufMetadata};
pub use model::{Model, ModelIdentity, ModelOptions};
pub use pipeline::PredictionStream;
