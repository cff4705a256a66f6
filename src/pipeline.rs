//! ```text
//!   new()            init()/create()
//! Uninitialized ───────────────────▶ Initialized { chat: inactive }
//!                                     │        ▲
//!                          start_chat │        │ finish_chat
//!                                     ▼        │
//!                                   Initialized { chat: active }
//!
//! generate(): self-loop on either Initialized state
//! ```
//!
//! One engine per controller. An in-flight flag rejects overlapping
//! generations and chat transitions made while one is streaming.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::PipelineConfig;
use crate::engine::{CandleBackend, InferenceBackend, InferenceEngine};
use crate::error::{PipelineError, Result, ValidationError};
use crate::options::GenerationOptions;
use crate::prompting::ChatMessage;
use crate::session::ChatSession;

pub type StreamCallback<'cb> = Box<dyn FnMut(&str) -> anyhow::Result<()> + 'cb>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Llm,
}

impl FromStr for PipelineKind {
    type Err = PipelineError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "LLMPipeline" => Ok(Self::Llm),
            other => Err(PipelineError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Llm => write!(f, "LLMPipeline"),
        }
    }
}

/// Unchecked `generate` arguments, as a scripting binding hands them over.
#[derive(Default)]
pub struct GenerateArgs<'cb> {
    pub prompt: Option<Value>,
    pub callback: Option<StreamCallback<'cb>>,
    pub options: Option<Value>,
    pub cancel: Option<CancellationToken>,
}

impl<'cb> GenerateArgs<'cb> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prompt(mut self, prompt: impl Into<Value>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn callback(mut self, callback: impl FnMut(&str) -> anyhow::Result<()> + 'cb) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn options(mut self, options: impl Into<Value>) -> Self {
        self.options = Some(options.into());
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Checks prompt, callback and options, in that order.
    pub fn validate(self) -> std::result::Result<GenerationRequest<'cb>, ValidationError> {
        let prompt = match self.prompt {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => return Err(ValidationError::PromptNotString),
        };
        let callback = self.callback.ok_or(ValidationError::CallbackNotFunction)?;
        let options = GenerationOptions::from_value(self.options.as_ref())?;

        Ok(GenerationRequest {
            prompt,
            callback,
            options,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

impl fmt::Debug for GenerateArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerateArgs")
            .field("prompt", &self.prompt)
            .field("callback", &self.callback.as_ref().map(|_| "<fn>"))
            .field("options", &self.options)
            .finish()
    }
}

pub struct GenerationRequest<'cb> {
    pub prompt: String,
    pub callback: StreamCallback<'cb>,
    pub options: GenerationOptions,
    pub cancel: CancellationToken,
}

struct ControllerState {
    engine: Option<Box<dyn InferenceEngine>>,
    session: ChatSession,
}

pub struct PipelineController {
    kind: PipelineKind,
    model_path: PathBuf,
    device: String,
    config: PipelineConfig,
    backend: Arc<dyn InferenceBackend>,
    state: Mutex<ControllerState>,
    in_flight: AtomicBool,
    // Mirrors of the locked state, readable from inside a callback.
    initialized: AtomicBool,
    chat_active: AtomicBool,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PipelineController {
    /// Uninitialized controller over the candle engine. Config is looked up
    /// next to the model.
    pub fn new(kind: &str, model_path: impl AsRef<Path>, device: &str) -> Result<Self> {
        let config = PipelineConfig::load_for_model(model_path.as_ref())?;
        Self::with_backend(kind, model_path, device, Arc::new(CandleBackend), config)
    }

    pub fn with_backend(
        kind: &str,
        model_path: impl AsRef<Path>,
        device: &str,
        backend: Arc<dyn InferenceBackend>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let kind = kind.parse::<PipelineKind>()?;
        let session = ChatSession::new(config.chat.clone());

        Ok(Self {
            kind,
            model_path: model_path.as_ref().to_path_buf(),
            device: device.to_string(),
            config,
            backend,
            state: Mutex::new(ControllerState {
                engine: None,
                session,
            }),
            in_flight: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            chat_active: AtomicBool::new(false),
        })
    }

    pub fn create(kind: &str, model_path: impl AsRef<Path>, device: &str) -> Result<Self> {
        let controller = Self::new(kind, model_path, device)?;
        controller.init()?;
        Ok(controller)
    }

    /// Loads the model. Succeeds at most once per controller.
    pub fn init(&self) -> Result<()> {
        // The state lock is held for the whole generation.
        self.ensure_idle()?;

        let mut state = self.lock_state();
        if state.engine.is_some() {
            return Err(PipelineError::AlreadyInitialized);
        }

        info!(
            kind = %self.kind,
            model = %self.model_path.display(),
            device = %self.device,
            "initializing pipeline"
        );
        let engine = self
            .backend
            .load(&self.model_path, &self.device)
            .map_err(PipelineError::Engine)?;
        state.engine = Some(engine);
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_chat_active(&self) -> bool {
        self.chat_active.load(Ordering::Acquire)
    }

    /// Fails with `GenerationInProgress` while a generation holds the state.
    pub fn history(&self) -> Result<Vec<ChatMessage>> {
        match self.state.try_lock() {
            Ok(state) => Ok(state.session.history().to_vec()),
            Err(TryLockError::Poisoned(poisoned)) => {
                Ok(poisoned.into_inner().session.history().to_vec())
            }
            Err(TryLockError::WouldBlock) if self.in_flight.load(Ordering::Acquire) => {
                Err(PipelineError::GenerationInProgress)
            }
            Err(TryLockError::WouldBlock) => Ok(self.lock_state().session.history().to_vec()),
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn start_chat(&self) -> Result<()> {
        self.ensure_idle()?;
        let mut state = self.lock_state();
        let ControllerState { engine, session } = &mut *state;
        let engine = engine.as_mut().ok_or(PipelineError::NotInitialized)?;

        if session.is_active() {
            return Err(PipelineError::ChatAlreadyStarted);
        }
        engine.begin_session().map_err(PipelineError::Engine)?;
        session.start()?;
        self.chat_active.store(true, Ordering::Release);
        debug!("chat started");
        Ok(())
    }

    pub fn finish_chat(&self) -> Result<()> {
        self.ensure_idle()?;
        let mut state = self.lock_state();
        let ControllerState { engine, session } = &mut *state;
        let engine = engine.as_mut().ok_or(PipelineError::NotInitialized)?;

        if !session.is_active() {
            return Err(PipelineError::ChatNotStarted);
        }
        engine.end_session().map_err(PipelineError::Engine)?;
        session.finish()?;
        self.chat_active.store(false, Ordering::Release);
        debug!("chat finished");
        Ok(())
    }

    pub fn generate(&self, args: GenerateArgs<'_>) -> Result<String> {
        let request = args.validate()?;
        self.generate_request(request)
    }

    pub fn generate_text<'cb>(
        &self,
        prompt: &str,
        options: GenerationOptions,
        on_chunk: impl FnMut(&str) -> anyhow::Result<()> + 'cb,
    ) -> Result<String> {
        if prompt.is_empty() {
            return Err(ValidationError::PromptNotString.into());
        }
        self.generate_request(GenerationRequest {
            prompt: prompt.to_string(),
            callback: Box::new(on_chunk),
            options,
            cancel: CancellationToken::new(),
        })
    }

    pub fn generate_request(&self, request: GenerationRequest<'_>) -> Result<String> {
        let GenerationRequest {
            prompt,
            mut callback,
            options,
            cancel,
        } = request;

        let _guard = self.acquire_in_flight()?;
        let mut state = self.lock_state();
        let ControllerState { engine, session } = &mut *state;
        let engine = engine.as_mut().ok_or(PipelineError::NotInitialized)?;

        let params = options.resolve(&self.config.generation);
        let messages = session.messages_for(&prompt);
        debug!(
            chat_active = session.is_active(),
            history = messages.len() - 1,
            max_new_tokens = params.max_new_tokens,
            "generate"
        );

        let mut output = String::new();
        let mut chunks = 0usize;
        {
            let stream = engine
                .generate(&messages, &params)
                .map_err(PipelineError::Engine)?;

            for item in stream {
                if cancel.is_cancelled() {
                    debug!(chunks, "generation cancelled");
                    return Err(PipelineError::Cancelled);
                }

                let chunk = item.map_err(PipelineError::Engine)?;
                if chunk.is_empty() {
                    continue;
                }

                callback(&chunk).map_err(|e| {
                    warn!(chunks, "generation callback failed, aborting");
                    PipelineError::Callback(e)
                })?;
                output.push_str(&chunk);
                chunks += 1;
            }
        }

        session.commit_turn(&prompt, &output);
        debug!(chunks, chars = output.len(), "generation finished");
        Ok(output)
    }

    fn acquire_in_flight(&self) -> Result<InFlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PipelineError::GenerationInProgress)?;
        Ok(InFlightGuard(&self.in_flight))
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.in_flight.load(Ordering::Acquire) {
            return Err(PipelineError::GenerationInProgress);
        }
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineController")
            .field("kind", &self.kind)
            .field("model_path", &self.model_path)
            .field("device", &self.device)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(mut engine) = state.engine.take() {
            if state.session.is_active() {
                if let Err(e) = engine.end_session() {
                    warn!(error = %e, "failed to end chat session while releasing engine");
                }
            }
            debug!(model = %self.model_path.display(), "engine released");
        }
    }
}
