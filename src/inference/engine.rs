//! Native inference engine
//!
//! All interaction with llama-cpp lives here. llama-cpp-2 types
//! (`LlamaBackend`, `LlamaModel`, `LlamaContext`) hold raw pointers that are
//! not `Send`, so a dedicated worker thread owns them; the handle
//! communicates over channels and stays `Send`.
//!
//! One `Chat` command produces one event stream: a role-announcement event
//! carrying the response identity, then one content event per decoded
//! fragment, closed by a terminal event whose finish reason is `stop`,
//! `length`, or `error`.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use thiserror::Error;

use crate::context::{ContentBlock, TurnContent, TurnMessage};
use crate::types::{FinishReason, Role, SamplingParams};

/// Errors from engine setup; generation failures are reported in-stream.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("worker thread gone: {0}")]
    WorkerGone(String),
}

/// One event of an engine chat stream
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// First event of a stream: response identity, no content
    Role {
        id: String,
        model: String,
        created: i64,
        role: Role,
    },
    /// Incremental decode output; a terminal finish reason closes the stream
    Content {
        content: String,
        finish_reason: FinishReason,
    },
}

/// Everything the worker needs to construct the engine instance
#[derive(Debug, Clone)]
pub struct LoadSpec {
    /// Model identity reported in response deltas
    pub name: String,
    pub model_path: PathBuf,
    /// Companion image-projection file. Resolved and validated by the
    /// loader; llama-cpp-2 exposes no clip bindings, so it is recorded here
    /// and image blocks render as their tag markers in the text prompt.
    pub mmproj_path: Option<PathBuf>,
    /// Context window size
    pub n_ctx: u32,
    /// Lock model memory (mlock) so it is never swapped out
    pub use_mlock: bool,
    pub n_gpu_layers: u32,
}

enum WorkerCommand {
    Load {
        spec: LoadSpec,
        response_tx: Sender<Result<(), EngineError>>,
    },
    Chat {
        messages: Vec<(String, String)>,
        params: SamplingParams,
        event_tx: Sender<ChatEvent>,
        stop: Arc<AtomicBool>,
    },
    Shutdown,
}

/// Handle to one loaded engine instance
///
/// The worker thread serializes all commands, so at most one generation is
/// ever decoding per engine instance.
pub struct LlamaEngine {
    command_tx: Option<Sender<WorkerCommand>>,
    worker: Option<JoinHandle<()>>,
    name: String,
}

impl LlamaEngine {
    /// Construct the engine: spawn the worker thread and load the model.
    ///
    /// Blocks until the model is in memory or loading failed; callers run
    /// this inside the model handle's background load worker.
    pub fn load(spec: LoadSpec) -> Result<Self, EngineError> {
        let name = spec.name.clone();
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();

        let worker = thread::spawn(move || worker_main(command_rx));

        let engine = Self {
            command_tx: Some(command_tx),
            worker: Some(worker),
            name,
        };

        let (response_tx, response_rx) = mpsc::channel();
        engine.send(WorkerCommand::Load { spec, response_tx })?;
        response_rx
            .recv()
            .map_err(|e| EngineError::WorkerGone(e.to_string()))??;

        tracing::info!(model = %engine.name, "engine ready");
        Ok(engine)
    }

    /// Model identity reported in response deltas.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start one streaming chat completion over the full turn log.
    ///
    /// Returns the event receiver and a stop signal; raising the signal
    /// aborts the generation within one decode step.
    pub fn chat_stream(
        &self,
        messages: Vec<(String, String)>,
        params: SamplingParams,
    ) -> Result<(Receiver<ChatEvent>, Arc<AtomicBool>), EngineError> {
        let (event_tx, event_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));

        self.send(WorkerCommand::Chat {
            messages,
            params,
            event_tx,
            stop: stop.clone(),
        })?;

        Ok((event_rx, stop))
    }

    fn send(&self, command: WorkerCommand) -> Result<(), EngineError> {
        self.command_tx
            .as_ref()
            .ok_or_else(|| EngineError::WorkerGone("engine shut down".to_string()))?
            .send(command)
            .map_err(|e| EngineError::WorkerGone(e.to_string()))
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Flatten rendered turns into role/content string pairs for the chat
/// template. Image blocks contribute only their `tag=` markers, which
/// already precede them as text blocks.
pub(crate) fn to_prompt_messages(messages: &[TurnMessage]) -> Vec<(String, String)> {
    messages
        .iter()
        .map(|message| {
            let content = match &message.content {
                TurnContent::Text(text) => text.clone(),
                TurnContent::Blocks(blocks) => blocks
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        ContentBlock::ImageUrl { .. } => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
            (message.role.as_str().to_string(), content)
        })
        .collect()
}

struct LoadedChatModel {
    model: LlamaModel,
    template: LlamaChatTemplate,
    name: String,
    n_ctx: u32,
}

fn worker_main(command_rx: Receiver<WorkerCommand>) {
    let mut backend: Option<LlamaBackend> = None;
    let mut loaded: Option<LoadedChatModel> = None;

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Load { spec, response_tx }) => {
                match load_chat_model(&mut backend, spec) {
                    Ok(model) => {
                        loaded = Some(model);
                        let _ = response_tx.send(Ok(()));
                    }
                    Err(e) => {
                        tracing::error!("model load failed in worker: {e}");
                        let _ = response_tx.send(Err(e));
                    }
                }
            }
            Ok(WorkerCommand::Chat {
                messages,
                params,
                event_tx,
                stop,
            }) => match (&backend, &loaded) {
                (Some(backend), Some(model)) => {
                    run_chat(backend, model, messages, params, &event_tx, &stop);
                }
                _ => {
                    let _ = event_tx.send(ChatEvent::Content {
                        content: String::new(),
                        finish_reason: FinishReason::Error,
                    });
                }
            },
            Ok(WorkerCommand::Shutdown) | Err(_) => {
                tracing::debug!("engine worker shutting down");
                break;
            }
        }
    }
}

fn load_chat_model(
    backend: &mut Option<LlamaBackend>,
    spec: LoadSpec,
) -> Result<LoadedChatModel, EngineError> {
    if backend.is_none() {
        *backend = Some(
            LlamaBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))?,
        );
        tracing::debug!("llama backend initialized in worker thread");
    }
    let backend_ref = backend
        .as_ref()
        .ok_or_else(|| EngineError::BackendInit("backend unavailable".to_string()))?;

    let mut model_params = LlamaModelParams::default().with_n_gpu_layers(spec.n_gpu_layers);
    if spec.use_mlock {
        model_params = model_params.with_use_mlock(true);
    }

    let model = LlamaModel::load_from_file(backend_ref, &spec.model_path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

    let template = match model.chat_template(None) {
        Ok(template) => template,
        Err(_) => {
            tracing::warn!("model has no embedded chat template, falling back to chatml");
            LlamaChatTemplate::new("chatml")
                .map_err(|e| EngineError::ModelLoad(e.to_string()))?
        }
    };

    let n_ctx = spec.n_ctx.min(model.n_ctx_train());
    if let Some(mmproj) = &spec.mmproj_path {
        tracing::info!("companion image projector recorded: {}", mmproj.display());
    }

    tracing::info!(
        model = %spec.name,
        n_ctx,
        params = model.n_params(),
        "model loaded"
    );

    Ok(LoadedChatModel {
        model,
        template,
        name: spec.name,
        n_ctx,
    })
}

/// Drive one generation, sending events until a terminal finish reason.
fn run_chat(
    backend: &LlamaBackend,
    loaded: &LoadedChatModel,
    messages: Vec<(String, String)>,
    params: SamplingParams,
    tx: &Sender<ChatEvent>,
    stop: &Arc<AtomicBool>,
) {
    let header = ChatEvent::Role {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        model: loaded.name.clone(),
        created: chrono::Utc::now().timestamp(),
        role: Role::Assistant,
    };
    if tx.send(header).is_err() {
        return;
    }

    let terminal = |reason: FinishReason| {
        let _ = tx.send(ChatEvent::Content {
            content: String::new(),
            finish_reason: reason,
        });
    };

    let prompt_tokens = match tokenize_prompt(loaded, messages) {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::error!("prompt preparation failed: {e}");
            terminal(FinishReason::Error);
            return;
        }
    };

    // the rendered context no longer fits the window at all
    if prompt_tokens.len() as u32 >= loaded.n_ctx {
        tracing::error!(
            prompt_tokens = prompt_tokens.len(),
            n_ctx = loaded.n_ctx,
            "conversation exceeds the context window before generation"
        );
        terminal(FinishReason::Length);
        return;
    }

    if let Err(e) = decode_loop(backend, loaded, prompt_tokens, params, tx, stop) {
        tracing::error!("generation failed: {e}");
        terminal(FinishReason::Error);
    }
}

fn tokenize_prompt(
    loaded: &LoadedChatModel,
    messages: Vec<(String, String)>,
) -> Result<Vec<llama_cpp_2::token::LlamaToken>, String> {
    let chat_messages: Vec<LlamaChatMessage> = messages
        .into_iter()
        .map(|(role, content)| LlamaChatMessage::new(role, content))
        .collect::<Result<_, _>>()
        .map_err(|e| format!("failed to build chat messages: {e}"))?;

    let prompt = loaded
        .model
        .apply_chat_template(&loaded.template, &chat_messages, true)
        .map_err(|e| format!("failed to apply chat template: {e}"))?;

    loaded
        .model
        .str_to_token(&prompt, AddBos::Always)
        .map_err(|e| format!("failed to tokenize prompt: {e}"))
}

fn decode_loop(
    backend: &LlamaBackend,
    loaded: &LoadedChatModel,
    prompt_tokens: Vec<llama_cpp_2::token::LlamaToken>,
    params: SamplingParams,
    tx: &Sender<ChatEvent>,
    stop: &Arc<AtomicBool>,
) -> Result<(), String> {
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(loaded.n_ctx))
        .with_n_batch(512);

    let mut ctx = loaded
        .model
        .new_context(backend, ctx_params)
        .map_err(|e| format!("failed to create context: {e}"))?;

    let mut batch = LlamaBatch::new(512, 1);
    for (i, token) in prompt_tokens.iter().enumerate() {
        let is_last = i == prompt_tokens.len() - 1;
        batch
            .add(*token, i as i32, &[0], is_last)
            .map_err(|e| format!("failed to batch prompt token: {e}"))?;
    }
    ctx.decode(&mut batch)
        .map_err(|e| format!("failed to decode prompt: {e}"))?;

    let mut sampler = build_sampler(&params);
    let mut n_decoded = prompt_tokens.len() as u32;
    // unset max_tokens: generate until the window or a model stop token
    let budget = params
        .max_tokens
        .unwrap_or(loaded.n_ctx - prompt_tokens.len() as u32);

    let mut utf8_buffer: Vec<u8> = Vec::new();

    for _ in 0..budget {
        if stop.load(Ordering::Relaxed) {
            tracing::debug!("generation cancelled by stop signal");
            return Ok(());
        }

        let token = sampler.sample(&ctx, batch.n_tokens() - 1);
        sampler.accept(token);

        if loaded.model.is_eog_token(token) {
            if let Some(fragment) = drain_utf8(&mut utf8_buffer) {
                let _ = tx.send(ChatEvent::Content {
                    content: fragment,
                    finish_reason: FinishReason::None,
                });
            }
            let _ = tx.send(ChatEvent::Content {
                content: String::new(),
                finish_reason: FinishReason::Stop,
            });
            return Ok(());
        }

        let bytes = loaded
            .model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| format!("failed to detokenize: {e}"))?;
        utf8_buffer.extend_from_slice(&bytes);

        if let Some(fragment) = drain_utf8(&mut utf8_buffer) {
            let event = ChatEvent::Content {
                content: fragment,
                finish_reason: FinishReason::None,
            };
            if tx.send(event).is_err() {
                tracing::debug!("receiver dropped, stopping generation");
                return Ok(());
            }
        }

        batch.clear();
        batch
            .add(token, n_decoded as i32, &[0], true)
            .map_err(|e| format!("failed to batch token: {e}"))?;
        ctx.decode(&mut batch)
            .map_err(|e| format!("failed to decode: {e}"))?;

        n_decoded += 1;
        if n_decoded >= loaded.n_ctx {
            break;
        }
    }

    // window or token budget exhausted without a stop token
    if let Some(fragment) = drain_utf8(&mut utf8_buffer) {
        let _ = tx.send(ChatEvent::Content {
            content: fragment,
            finish_reason: FinishReason::None,
        });
    }
    let _ = tx.send(ChatEvent::Content {
        content: String::new(),
        finish_reason: FinishReason::Length,
    });
    Ok(())
}

fn build_sampler(params: &SamplingParams) -> LlamaSampler {
    if params.temperature < 0.01 {
        return LlamaSampler::greedy();
    }

    let seed = params.seed.unwrap_or_else(entropy_seed);
    LlamaSampler::chain_simple([
        LlamaSampler::top_k(params.top_k),
        LlamaSampler::top_p(params.top_p, 1),
        LlamaSampler::min_p(params.min_p, 1),
        LlamaSampler::temp(params.temperature),
        LlamaSampler::dist(seed),
    ])
}

/// Seed drawn from system entropy when the request carries none.
fn entropy_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}

/// Pull the longest valid UTF-8 prefix out of the buffer, keeping any
/// trailing incomplete sequence for the next token.
fn drain_utf8(buffer: &mut Vec<u8>) -> Option<String> {
    let valid_len = match std::str::from_utf8(buffer) {
        Ok(_) => buffer.len(),
        Err(e) => e.valid_up_to(),
    };

    if valid_len == 0 {
        return None;
    }

    let fragment = String::from_utf8_lossy(&buffer[..valid_len]).into_owned();
    buffer.drain(..valid_len);
    Some(fragment)
}
