//! Inference engine collaborators.
//!
//! The controller only talks to the two traits below. [`LLMEngine`] runs
//! quantized GGUF models through candle; [`mock::MockEngine`] is a scripted
//! stand-in with the same streaming behaviour.

mod device;
mod lifecycle;
pub mod mock;
mod stream;
mod tokenizer;

use std::path::Path;

use candle_core::Device;
use tokenizers::Tokenizer;

use crate::backend::RuntimeModel;
use crate::options::SamplingParams;
use crate::prompting::{ChatMessage, ChatTemplate, PromptFamily};

pub use device::DeviceSelector;
pub use lifecycle::CandleBackend;
pub use mock::{MockBackend, MockEngine, MockStats};

/// Lazy, finite, non-restartable sequence of generated text chunks.
pub type ChunkStream<'a> = Box<dyn Iterator<Item = anyhow::Result<String>> + 'a>;

/// A loaded model, exclusively owned by one controller.
pub trait InferenceEngine: Send {
    /// Called when a chat session starts.
    fn begin_session(&mut self) -> anyhow::Result<()>;

    /// Called when a chat session ends.
    fn end_session(&mut self) -> anyhow::Result<()>;

    /// Starts one generation turn over `messages` (the last one is the new
    /// user prompt). Dropping the stream aborts the generation.
    fn generate<'a>(
        &'a mut self,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> anyhow::Result<ChunkStream<'a>>;
}

/// Loads engines from a model path and a device selector string.
pub trait InferenceBackend: Send + Sync {
    fn load(&self, model_path: &Path, device: &str) -> anyhow::Result<Box<dyn InferenceEngine>>;
}

pub struct LLMEngine {
    pub(super) model: RuntimeModel,
    pub(super) model_path: String,
    pub tokenizer: Tokenizer,
    pub(super) device: Device,
    pub(super) family: PromptFamily,
    pub(super) template: Option<ChatTemplate>,
    pub(super) stop_token_ids: Vec<u32>,
    pub(super) in_session: bool,
}
