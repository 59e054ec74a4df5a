//! VoxServe core library
//!
//! Streaming inference core for a locally hosted multimodal chat server:
//! conversation context management, model lifecycle, and the prediction
//! pipeline that turns llama-cpp token streams into response deltas.
//!
//! The HTTP transport sitting on top of this crate only needs three things:
//! build an [`inference::Model`] from a [`config::ChatConfig`] snapshot, call
//! `start_load()`, then feed [`types::ChatRequest`]s to `predict()` and
//! forward the resulting [`inference::PredictionStream`] as newline-delimited
//! JSON.

pub mod config;
pub mod context;
pub mod inference;
pub mod logging;
pub mod media;
pub mod storage;
pub mod types;
