//! Shared type definitions
//!
//! Request, response, and role types crossing the crate boundary.

pub mod message;
pub mod request;
pub mod response;

pub use message::Role;
pub use request::{ChatRequest, ImageData, SamplingParams};
pub use response::{ChatResponseDelta, FinishReason};
