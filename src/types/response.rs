//! Chat response deltas
//!
//! One [`ChatResponseDelta`] per incremental content event, serialized as
//! newline-delimited JSON for the streaming HTTP layer.

use serde::{Deserialize, Serialize};

use crate::types::Role;

/// Why a generation stream ended, or `None` while it is still running.
///
/// Serializes as a lowercase string (`"none"`, never JSON null).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// Generation still in progress
    None,
    /// Context window or token budget exhausted
    Length,
    /// Model produced its end-of-generation token
    Stop,
    /// The engine stream failed
    Error,
}

impl FinishReason {
    /// True for `length`, `stop`, and `error`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, FinishReason::None)
    }
}

/// One incremental unit of a streamed generation response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponseDelta {
    /// Response identifier, constant across one stream
    pub id: String,
    /// Identity of the model that produced the response
    pub model: String,
    /// Unix timestamp of stream start
    pub created: i64,
    /// Running position of this delta within the stream (0, 1, 2, ...),
    /// not an engine choice index
    pub index: u32,
    /// Role of the responder; present only on the first delta of a turn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Incremental (not cumulative) content fragment
    pub content: String,
    pub finish_reason: FinishReason,
}

impl ChatResponseDelta {
    /// Encode as one newline-terminated JSON line.
    pub fn to_ndjson(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
