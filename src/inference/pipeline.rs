//! Prediction pipeline
//!
//! Translates an engine chat-event stream into a lazy sequence of
//! [`ChatResponseDelta`]s and commits the finished assistant turn back into
//! the conversation context exactly once.
//!
//! The stream is single-pass and non-restartable. Dropping it mid-flight
//! raises the engine's stop signal and commits nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

use crate::context::ChatContext;
use crate::inference::engine::ChatEvent;
use crate::types::{ChatResponseDelta, FinishReason, Role};

/// Response identity announced by the stream's first event
#[derive(Debug, Clone)]
struct StreamHeader {
    id: String,
    model: String,
    created: i64,
    role: Role,
}

/// Lazy delta stream for one prediction
///
/// Yields exactly one delta per engine content event. While the stream is
/// alive it holds the handle's generation lock, so a second prediction
/// against the same model queues behind it.
pub struct PredictionStream {
    events: Receiver<ChatEvent>,
    stop: Arc<AtomicBool>,
    context: Arc<Mutex<ChatContext>>,
    header: Option<StreamHeader>,
    accumulated: String,
    index: u32,
    role_sent: bool,
    done: bool,
    _generation: Option<OwnedMutexGuard<()>>,
}

impl PredictionStream {
    pub(crate) fn new(
        events: Receiver<ChatEvent>,
        stop: Arc<AtomicBool>,
        context: Arc<Mutex<ChatContext>>,
        generation: Option<OwnedMutexGuard<()>>,
    ) -> Self {
        Self {
            events,
            stop,
            context,
            header: None,
            accumulated: String::new(),
            index: 0,
            role_sent: false,
            done: false,
            _generation: generation,
        }
    }

    fn delta(&mut self, content: String, finish_reason: FinishReason) -> ChatResponseDelta {
        let role = if self.role_sent {
            None
        } else {
            self.role_sent = true;
            Some(
                self.header
                    .as_ref()
                    .map(|h| h.role)
                    .unwrap_or(Role::Assistant),
            )
        };

        let (id, model, created) = match &self.header {
            Some(header) => (header.id.clone(), header.model.clone(), header.created),
            // engine failed before announcing itself; identity stays zeroed
            None => (String::new(), String::new(), 0),
        };

        let delta = ChatResponseDelta {
            id,
            model,
            created,
            index: self.index,
            role,
            content,
            finish_reason,
        };
        self.index += 1;
        delta
    }

    /// Commit the accumulated assistant text as one turn. Runs at most once
    /// per stream, guarded by `done`.
    fn commit(&mut self) {
        let role = self
            .header
            .as_ref()
            .map(|h| h.role)
            .unwrap_or(Role::Assistant);
        let text = std::mem::take(&mut self.accumulated);

        let mut context = self
            .context
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        context.append(role, Some(&text), None);

        tracing::debug!(chars = text.len(), "assistant turn committed");
    }
}

impl Iterator for PredictionStream {
    type Item = ChatResponseDelta;

    fn next(&mut self) -> Option<ChatResponseDelta> {
        if self.done {
            return None;
        }

        loop {
            match self.events.recv() {
                Ok(ChatEvent::Role {
                    id,
                    model,
                    created,
                    role,
                }) => {
                    self.header = Some(StreamHeader {
                        id,
                        model,
                        created,
                        role,
                    });
                }
                Ok(ChatEvent::Content {
                    content,
                    finish_reason,
                }) => {
                    self.accumulated.push_str(&content);

                    match finish_reason {
                        FinishReason::Stop => {
                            self.done = true;
                            self.commit();
                        }
                        FinishReason::Length | FinishReason::Error => {
                            // failed generation: terminal delta, no commit
                            self.done = true;
                        }
                        FinishReason::None => {}
                    }

                    return Some(self.delta(content, finish_reason));
                }
                Err(_) => {
                    // channel closed without a terminal event
                    self.done = true;
                    return Some(self.delta(String::new(), FinishReason::Error));
                }
            }
        }
    }
}

impl Drop for PredictionStream {
    fn drop(&mut self) {
        // cancellation: abandoning the stream closes the generation
        self.stop.store(true, Ordering::Relaxed);
    }
}
