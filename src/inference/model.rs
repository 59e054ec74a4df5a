//! Model handle
//!
//! Owns the lifecycle of one loaded model instance: construction,
//! asynchronous load, readiness gating, prediction, and teardown.
//!
//! State machine: `Constructed → Loading → Ready | Failed → Unloaded`.
//! `start_load` fires one background worker and returns immediately;
//! callers gate on `await_ready`, which blocks on a condition variable
//! instead of polling.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::ChatConfig;
use crate::context::ChatContext;
use crate::inference::engine::{to_prompt_messages, LlamaEngine, LoadSpec};
use crate::inference::error::ModelError;
use crate::inference::gguf::validate_gguf;
use crate::inference::pipeline::PredictionStream;
use crate::storage::hub;
use crate::storage::Hub;
use crate::types::{ChatRequest, ChatResponseDelta, Role, SamplingParams};

/// Resolved model identity: a local file or a remote repository reference
#[derive(Debug, Clone)]
pub enum ModelIdentity {
    Local(PathBuf),
    Hub(Hub),
}

impl ModelIdentity {
    /// Identity string reported in response deltas and logs.
    pub fn name(&self) -> String {
        match self {
            ModelIdentity::Local(path) => path.display().to_string(),
            ModelIdentity::Hub(hub) => hub.repo_id.clone(),
        }
    }
}

/// Where the companion image processor comes from
#[derive(Debug, Clone)]
enum ClipSource {
    /// Local mmproj file
    Path(PathBuf),
    /// Filename pattern resolved against the hub repository at load time
    Pattern(String),
}

/// Construction options for a model handle
#[derive(Debug, Clone)]
pub struct ModelOptions {
    /// Local path to a companion image-projection (mmproj) file
    pub image_processor: Option<PathBuf>,
    /// Wire image capability; for hub identities this resolves the repo's
    /// clip pattern at load time
    pub multi_model: bool,
    /// Immutable configuration snapshot captured by this handle
    pub config: ChatConfig,
    /// Readiness wait budget; `None` waits indefinitely
    pub timeout: Option<Duration>,
    pub n_gpu_layers: u32,
    /// Hub API token for gated repositories
    pub huggingface_key: Option<String>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            image_processor: None,
            multi_model: false,
            config: ChatConfig::default(),
            timeout: None,
            n_gpu_layers: 99,
            huggingface_key: None,
        }
    }
}

/// Lifecycle states; `Ready` carries the live engine instance
enum LoadPhase<T> {
    Constructed,
    Loading,
    Ready(T),
    Failed(String),
    Unloaded,
}

impl<T> LoadPhase<T> {
    fn label(&self) -> &'static str {
        match self {
            LoadPhase::Constructed => "constructed",
            LoadPhase::Loading => "loading",
            LoadPhase::Ready(_) => "ready",
            LoadPhase::Failed(_) => "failed",
            LoadPhase::Unloaded => "unloaded",
        }
    }
}

/// Condition-variable readiness gate shared between the handle and its
/// background load worker.
struct LoadGate<T> {
    phase: Mutex<LoadPhase<T>>,
    cond: Condvar,
}

impl<T> LoadGate<T> {
    fn new() -> Self {
        Self {
            phase: Mutex::new(LoadPhase::Constructed),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoadPhase<T>> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, phase: LoadPhase<T>) {
        *self.lock() = phase;
        self.cond.notify_all();
    }

    fn is_ready(&self) -> bool {
        matches!(*self.lock(), LoadPhase::Ready(_))
    }

    /// Block until the gate leaves `Loading`, or the timeout elapses.
    ///
    /// A timeout aborts only the wait: the background load keeps running
    /// and a later call can still observe `Ready`.
    fn await_ready(&self, timeout: Option<Duration>) -> Result<(), ModelError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut phase = self.lock();

        loop {
            match &*phase {
                LoadPhase::Ready(_) => return Ok(()),
                LoadPhase::Failed(msg) => return Err(ModelError::FailedToLoad(msg.clone())),
                LoadPhase::Unloaded => {
                    return Err(ModelError::FailedToLoad("model is unloaded".to_string()))
                }
                LoadPhase::Constructed => {
                    return Err(ModelError::FailedToLoad(
                        "model load has not been started".to_string(),
                    ))
                }
                LoadPhase::Loading => match deadline {
                    None => {
                        phase = self
                            .cond
                            .wait(phase)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(ModelError::TookTooLongToLoad(
                                "readiness wait exceeded the configured timeout".to_string(),
                            ));
                        }
                        let (guard, _) = self
                            .cond
                            .wait_timeout(phase, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner);
                        phase = guard;
                    }
                },
            }
        }
    }

    /// Run a closure against the live engine, or fail with the lifecycle
    /// error matching the current state.
    fn with_ready<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, ModelError> {
        let phase = self.lock();
        match &*phase {
            LoadPhase::Ready(engine) => Ok(f(engine)),
            LoadPhase::Failed(msg) => Err(ModelError::FailedToLoad(msg.clone())),
            other => Err(ModelError::FailedToLoad(format!(
                "model is not ready (state: {})",
                other.label()
            ))),
        }
    }
}

/// Handle to one model instance and its conversation
///
/// Dropping the handle unloads the model; `unload` can also be called
/// explicitly and is idempotent.
pub struct Model {
    identity: ModelIdentity,
    clip_source: Option<ClipSource>,
    config: ChatConfig,
    timeout: Option<Duration>,
    n_gpu_layers: u32,
    huggingface_key: Option<String>,
    gate: Arc<LoadGate<LlamaEngine>>,
    context: Arc<Mutex<ChatContext>>,
    generation: Arc<tokio::sync::Mutex<()>>,
}

impl Model {
    /// Construct a handle without loading anything.
    ///
    /// Local identities are validated here: the path must exist and carry
    /// the GGUF magic, otherwise `ModelNotFound` surfaces synchronously and
    /// no background work is started. Remote references are resolved at
    /// load time.
    pub fn new(identity: ModelIdentity, options: ModelOptions) -> Result<Self, ModelError> {
        let (identity, clip_source) = match identity {
            ModelIdentity::Local(path) => {
                let path = path
                    .canonicalize()
                    .map_err(|_| ModelError::ModelNotFound(path.display().to_string()))?;
                validate_gguf(&path).map_err(|e| {
                    ModelError::ModelNotFound(format!("{}: {e}", path.display()))
                })?;

                let clip = options.image_processor.clone().map(ClipSource::Path);
                (ModelIdentity::Local(path), clip)
            }
            ModelIdentity::Hub(hub) => {
                let clip = if let Some(path) = options.image_processor.clone() {
                    Some(ClipSource::Path(path))
                } else if options.multi_model {
                    Some(ClipSource::Pattern(hub.clip_name.clone()))
                } else {
                    None
                };
                (ModelIdentity::Hub(hub), clip)
            }
        };

        tracing::info!(model = %identity.name(), "model handle constructed");

        Ok(Self {
            identity,
            clip_source,
            context: Arc::new(Mutex::new(ChatContext::new(options.config.max_images))),
            config: options.config,
            timeout: options.timeout,
            n_gpu_layers: options.n_gpu_layers,
            huggingface_key: options.huggingface_key,
            gate: Arc::new(LoadGate::new()),
            generation: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Start the background load and return immediately.
    ///
    /// Everything that can go wrong in the background (missing hub files,
    /// engine construction failure) lands in the `Failed` state for later
    /// `await_ready`/`predict` callers; it never crashes the host.
    pub fn start_load(&self) {
        {
            let mut phase = self.gate.lock();
            match &*phase {
                LoadPhase::Constructed => *phase = LoadPhase::Loading,
                other => {
                    tracing::debug!(state = other.label(), "start_load ignored");
                    return;
                }
            }
        }

        let identity = self.identity.clone();
        let clip_source = self.clip_source.clone();
        let config = self.config.clone();
        let n_gpu_layers = self.n_gpu_layers;
        let token = self.huggingface_key.clone();
        let gate = self.gate.clone();

        tracing::info!(model = %identity.name(), "starting model load");

        let spawned = std::thread::Builder::new()
            .name("model-load".to_string())
            .spawn(move || {
                match load_worker(identity, clip_source, config, n_gpu_layers, token) {
                    Ok(engine) => gate.set(LoadPhase::Ready(engine)),
                    Err(e) => {
                        tracing::error!("model load failed: {e}");
                        gate.set(LoadPhase::Failed(e.to_string()));
                    }
                }
            });

        if let Err(e) = spawned {
            self.gate
                .set(LoadPhase::Failed(format!("failed to spawn load worker: {e}")));
        }
    }

    /// Block until the model is `Ready` or `Failed`, or the timeout elapses.
    pub fn await_ready(&self, timeout: Option<Duration>) -> Result<(), ModelError> {
        self.gate.await_ready(timeout)
    }

    /// Release the engine instance. Idempotent; also runs implicitly when
    /// the handle is dropped.
    pub fn unload(&self) {
        let mut phase = self.gate.lock();
        if matches!(&*phase, LoadPhase::Unloaded) {
            return;
        }
        tracing::info!(model = %self.identity.name(), "unloading model");
        *phase = LoadPhase::Unloaded;
        drop(phase);
        self.gate.cond.notify_all();
    }

    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    pub fn model_identity(&self) -> &ModelIdentity {
        &self.identity
    }

    pub fn multi_model_enabled(&self) -> bool {
        self.clip_source.is_some()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn current_config(&self) -> &ChatConfig {
        &self.config
    }

    /// The handle's conversation context.
    pub fn context(&self) -> Arc<Mutex<ChatContext>> {
        self.context.clone()
    }

    /// Run one streaming prediction.
    ///
    /// Gates on readiness (using the handle's timeout), appends the user's
    /// text and images into the conversation (images beyond the budget are
    /// dropped, not fatal), and returns the lazy delta stream. One
    /// generation runs per handle at a time; concurrent calls queue.
    ///
    /// Blocks the calling thread while waiting for readiness and for the
    /// generation lock. Inside an async host this must run on a blocking
    /// thread (`tokio::task::spawn_blocking`); `blocking_lock_owned` panics
    /// when called from a runtime worker.
    pub fn predict(&self, request: &ChatRequest) -> Result<PredictionStream, ModelError> {
        self.await_ready(self.timeout)?;

        // one in-flight generation per handle; held until the stream drops
        let guard = self.generation.clone().blocking_lock_owned();

        let messages = {
            let mut context = self
                .context
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            append_user_turn(&mut context, request);
            to_prompt_messages(&context.render())
        };

        let params = SamplingParams::from(request);
        tracing::info!(
            temperature = params.temperature,
            top_k = params.top_k,
            top_p = params.top_p,
            min_p = params.min_p,
            seed = ?params.seed,
            "starting prediction"
        );

        let (events, stop) = self
            .gate
            .with_ready(|engine| engine.chat_stream(messages, params))?
            .map_err(|e| ModelError::FailedToLoad(e.to_string()))?;

        Ok(PredictionStream::new(
            events,
            stop,
            self.context.clone(),
            Some(guard),
        ))
    }

    /// Run several independent requests against this handle.
    ///
    /// The engine is not assumed reentrant, so this is a queue over
    /// pipeline runs, not parallel decode: each stream is drained to
    /// completion before the next request starts.
    pub fn predict_batch(
        &self,
        requests: &[ChatRequest],
    ) -> Result<Vec<Vec<ChatResponseDelta>>, ModelError> {
        requests
            .iter()
            .map(|request| self.predict(request).map(Iterator::collect))
            .collect()
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        self.unload();
    }
}

/// Append a request as one user turn: its text plus every attached image
/// converted to the tagged data-URI form the context accepts.
fn append_user_turn(context: &mut ChatContext, request: &ChatRequest) {
    let tagged_images: Option<Vec<String>> = request.images.as_ref().map(|images| {
        images
            .iter()
            .map(|img| {
                let uri = format!("data:image/png;base64,{}", img.base64_img);
                crate::media::tagged_image(&img.img_id, &uri)
            })
            .collect()
    });

    context.append(Role::User, Some(&request.text), tagged_images.as_deref());
}

/// Background load: resolve files, then construct the engine.
fn load_worker(
    identity: ModelIdentity,
    clip_source: Option<ClipSource>,
    config: ChatConfig,
    n_gpu_layers: u32,
    token: Option<String>,
) -> Result<LlamaEngine, ModelError> {
    let token = token.as_deref();

    let (name, model_path, mmproj_path) = match &identity {
        ModelIdentity::Local(path) => {
            let mmproj = match clip_source {
                Some(ClipSource::Path(clip)) => Some(clip),
                Some(ClipSource::Pattern(pattern)) => {
                    return Err(ModelError::FailedToLoad(format!(
                        "clip pattern '{pattern}' cannot be resolved for a local model"
                    )))
                }
                None => None,
            };
            (identity.name(), path.clone(), mmproj)
        }
        ModelIdentity::Hub(hub) => {
            // async downloader driven from this worker thread
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| ModelError::FailedToLoad(e.to_string()))?;

            let model_file = runtime
                .block_on(hub::resolve_file(&hub.repo_id, &hub.file_name, token))
                .map_err(|e| ModelError::FailedToLoad(e.to_string()))?;
            let model_path = runtime
                .block_on(hub::download_file(&hub.repo_id, &model_file, token))
                .map_err(|e| ModelError::FailedToLoad(e.to_string()))?;

            let mmproj = match clip_source {
                Some(ClipSource::Pattern(pattern)) => {
                    let clip_file = runtime
                        .block_on(hub::resolve_file(&hub.repo_id, &pattern, token))
                        .map_err(|e| ModelError::FailedToLoad(e.to_string()))?;
                    let clip_path = runtime
                        .block_on(hub::download_file(&hub.repo_id, &clip_file, token))
                        .map_err(|e| ModelError::FailedToLoad(e.to_string()))?;
                    Some(clip_path)
                }
                Some(ClipSource::Path(clip)) => Some(clip),
                None => None,
            };

            (hub.repo_id.clone(), model_path, mmproj)
        }
    };

    validate_gguf(&model_path)
        .map_err(|e| ModelError::FailedToLoad(format!("{}: {e}", model_path.display())))?;
    if let Some(mmproj) = &mmproj_path {
        validate_gguf(mmproj).map_err(|e| {
            ModelError::FailedToLoad(format!("image processor {}: {e}", mmproj.display()))
        })?;
    }

    let engine = LlamaEngine::load(LoadSpec {
        name,
        model_path,
        mmproj_path,
        n_ctx: config.max_tokens,
        use_mlock: config.keep_in_mem,
        n_gpu_layers,
    })?;

    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContentBlock, TurnContent};
    use crate::types::ImageData;
    use std::io::Write;

    fn gguf_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"GGUF").unwrap();
        file.write_all(&3u32.to_le_bytes()).unwrap();
        file
    }

    #[test]
    fn test_nonexistent_local_path_fails_immediately() {
        let result = Model::new(
            ModelIdentity::Local(PathBuf::from("/nonexistent/model.gguf")),
            ModelOptions::default(),
        );
        assert!(matches!(result, Err(ModelError::ModelNotFound(_))));
    }

    #[test]
    fn test_local_non_gguf_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not a model").unwrap();

        let result = Model::new(
            ModelIdentity::Local(file.path().to_path_buf()),
            ModelOptions::default(),
        );
        assert!(matches!(result, Err(ModelError::ModelNotFound(_))));
    }

    #[test]
    fn test_constructed_handle_state() {
        let file = gguf_file();
        let model = Model::new(
            ModelIdentity::Local(file.path().to_path_buf()),
            ModelOptions::default(),
        )
        .unwrap();

        assert!(!model.is_ready());
        assert!(!model.multi_model_enabled());
        assert!(model.timeout().is_none());
        assert_eq!(model.current_config().max_images, 5);
        // the context is seeded with the system turn
        assert_eq!(model.context().lock().unwrap().turn_count(), 1);
    }

    #[test]
    fn test_hub_identity_needs_no_local_validation() {
        let model = Model::new(
            ModelIdentity::Hub(Hub::new("BAAI/Bunny-Llama-3-8B-V-gguf")),
            ModelOptions {
                multi_model: true,
                ..ModelOptions::default()
            },
        )
        .unwrap();

        assert!(model.multi_model_enabled());
        assert_eq!(model.model_identity().name(), "BAAI/Bunny-Llama-3-8B-V-gguf");
    }

    #[test]
    fn test_await_ready_before_start_load() {
        let file = gguf_file();
        let model = Model::new(
            ModelIdentity::Local(file.path().to_path_buf()),
            ModelOptions::default(),
        )
        .unwrap();

        assert!(matches!(
            model.await_ready(Some(Duration::from_millis(10))),
            Err(ModelError::FailedToLoad(_))
        ));
    }

    #[test]
    fn test_unload_is_idempotent() {
        let file = gguf_file();
        let model = Model::new(
            ModelIdentity::Local(file.path().to_path_buf()),
            ModelOptions::default(),
        )
        .unwrap();

        model.unload();
        model.unload();
        assert!(!model.is_ready());
        assert!(matches!(
            model.await_ready(None),
            Err(ModelError::FailedToLoad(_))
        ));
    }

    #[test]
    fn test_set_timeout() {
        let file = gguf_file();
        let mut model = Model::new(
            ModelIdentity::Local(file.path().to_path_buf()),
            ModelOptions::default(),
        )
        .unwrap();

        model.set_timeout(Some(Duration::from_secs(30)));
        assert_eq!(model.timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_request_appends_exactly_one_user_turn() {
        let mut context = ChatContext::new(5);
        let mut request = ChatRequest::text("what is on this slide?");
        request.images = Some(vec![ImageData {
            img_id: "slide1".to_string(),
            base64_img: "aGk=".to_string(),
        }]);

        append_user_turn(&mut context, &request);

        // system turn plus the new user turn
        assert_eq!(context.turn_count(), 2);
        assert_eq!(context.total_images(), 1);

        let turn = &context.turns()[1];
        assert_eq!(turn.role(), Role::User);
        assert_eq!(turn.text(), Some("what is on this slide?"));
        assert_eq!(turn.image_count(), 1);

        // the attachment carries the exact data-URI prefix the context accepts
        match &context.render()[1].content {
            TurnContent::Blocks(blocks) => {
                assert!(blocks.iter().any(|block| matches!(
                    block,
                    ContentBlock::ImageUrl { image_url }
                        if image_url.url == "data:image/png;base64,aGk="
                )));
            }
            other => panic!("expected blocks, got {other:?}"),
        }
    }

    #[test]
    fn test_text_only_request_appends_plain_user_turn() {
        let mut context = ChatContext::new(5);
        append_user_turn(&mut context, &ChatRequest::text("hello"));

        assert_eq!(context.turn_count(), 2);
        assert_eq!(context.total_images(), 0);
        assert_eq!(context.turns()[1].text(), Some("hello"));
        assert_eq!(context.turns()[1].image_count(), 0);
    }

    // LoadGate behavior is exercised with a unit payload so no real engine
    // is needed.

    #[test]
    fn test_gate_blocks_until_ready() {
        let gate: Arc<LoadGate<()>> = Arc::new(LoadGate::new());
        gate.set(LoadPhase::Loading);

        let setter = gate.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            setter.set(LoadPhase::Ready(()));
        });

        assert!(gate.await_ready(None).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_gate_timeout_then_later_ready() {
        let gate: Arc<LoadGate<()>> = Arc::new(LoadGate::new());
        gate.set(LoadPhase::Loading);

        let setter = gate.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            setter.set(LoadPhase::Ready(()));
        });

        // wait shorter than the load: times out without corrupting state
        assert!(matches!(
            gate.await_ready(Some(Duration::from_millis(10))),
            Err(ModelError::TookTooLongToLoad(_))
        ));

        // a later, longer wait still observes Ready
        assert!(gate.await_ready(Some(Duration::from_secs(5))).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_gate_failed_load() {
        let gate: LoadGate<()> = LoadGate::new();
        gate.set(LoadPhase::Failed("engine exploded".to_string()));

        match gate.await_ready(None) {
            Err(ModelError::FailedToLoad(msg)) => assert!(msg.contains("engine exploded")),
            other => panic!("expected FailedToLoad, got {other:?}"),
        }
    }

    #[test]
    fn test_gate_with_ready_on_wrong_state() {
        let gate: LoadGate<()> = LoadGate::new();
        gate.set(LoadPhase::Loading);

        assert!(matches!(
            gate.with_ready(|_| ()),
            Err(ModelError::FailedToLoad(_))
        ));
    }
}
