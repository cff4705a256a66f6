//! genai_pipeline: a single-session LLM generation pipeline.
//!
//! A [`PipelineController`] owns one inference engine, an optional chat
//! session and a streaming `generate` operation that hands each text chunk
//! to a caller-supplied callback while accumulating the full reply.
//! Quantized GGUF models run through candle; [`engine::MockBackend`] stands
//! in for them in tests.

pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod options;
pub mod pipeline;
pub mod prompting;
pub mod sample;
pub mod session;

pub mod backend;
pub mod engine;
pub mod model_catalog;

pub use cancel::CancellationToken;
pub use config::{ChatConfig, GenerationDefaults, LogFormat, LoggingConfig, PipelineConfig};
pub use engine::{CandleBackend, DeviceSelector, InferenceBackend, InferenceEngine, LLMEngine};
pub use error::{ErrorKind, PipelineError, Result, ValidationError};
pub use options::{GenerationOptions, SamplingParams};
pub use pipeline::{GenerateArgs, GenerationRequest, PipelineController, PipelineKind};
pub use prompting::{ChatMessage, Role};
