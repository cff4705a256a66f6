use std::path::Path;

use anyhow::{Error as E, Result};
use tracing::{debug, info};

use crate::backend::RuntimeModel;
use crate::model_catalog::resolve_model;
use crate::options::SamplingParams;
use crate::prompting::{format_conversation, stop_markers, ChatMessage, ChatTemplate};

use super::stream::GenerationStream;
use super::tokenizer::{load_tokenizer_config, resolve_stop_tokens, resolve_tokenizer_path, TokenizerConfig};
use super::{ChunkStream, DeviceSelector, InferenceBackend, InferenceEngine, LLMEngine};

/// Loads quantized GGUF models with candle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandleBackend;

impl InferenceBackend for CandleBackend {
    fn load(&self, model_path: &Path, device: &str) -> Result<Box<dyn InferenceEngine>> {
        let selector: DeviceSelector = device.parse()?;
        Ok(Box::new(LLMEngine::load(model_path, selector)?))
    }
}

impl LLMEngine {
    /// Loads weights, tokenizer and chat template for the model at `path`
    /// (a `.gguf` file or a directory containing one).
    pub fn load(path: &Path, selector: DeviceSelector) -> Result<Self> {
        let entry = resolve_model(path).map_err(E::msg)?;
        info!(model = %entry.path.display(), device = %selector, "loading model");

        let device = selector.to_candle()?;
        let (model, family, gguf_info) = RuntimeModel::load_from_gguf(&entry.path, entry.family, &device)?;
        debug!(?family, architecture = ?gguf_info.architecture, "weights loaded");

        let tokenizer_path = resolve_tokenizer_path(&entry.path, entry.tokenizer_path.clone())
            .ok_or_else(|| E::msg("Tokenizer not found for selected model (fail-fast policy)."))?;
        debug!(tokenizer = %tokenizer_path.display(), "loading tokenizer");
        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path).map_err(E::msg)?;

        let tok_config = match &entry.tokenizer_config_path {
            Some(path) => load_tokenizer_config(path)?,
            None => TokenizerConfig::default(),
        };

        let stop_token_ids = resolve_stop_tokens(&tokenizer, family, tok_config.eos_token.as_deref())?;

        let template = tok_config
            .chat_template
            .or(gguf_info.chat_template)
            .map(|source| {
                ChatTemplate::new(
                    source,
                    tok_config.bos_token.unwrap_or_default(),
                    tok_config.eos_token.unwrap_or_default(),
                )
            });

        info!(
            ?family,
            stop_tokens = ?stop_token_ids,
            jinja_template = template.is_some(),
            "model ready"
        );

        Ok(Self {
            model,
            model_path: entry.path.to_string_lossy().into_owned(),
            tokenizer,
            device,
            family,
            template,
            stop_token_ids,
            in_session: false,
        })
    }

    pub fn model_path(&self) -> &str {
        &self.model_path
    }

    fn render_prompt(&self, messages: &[ChatMessage]) -> Result<String> {
        match &self.template {
            Some(template) => template
                .render(messages)
                .map_err(|e| E::msg(format!("Chat template failed: {}", e))),
            None => Ok(format_conversation(messages, self.family)),
        }
    }
}

impl InferenceEngine for LLMEngine {
    fn begin_session(&mut self) -> Result<()> {
        debug!(model = %self.model_path, "chat session started");
        self.in_session = true;
        Ok(())
    }

    fn end_session(&mut self) -> Result<()> {
        debug!(model = %self.model_path, "chat session finished");
        self.in_session = false;
        Ok(())
    }

    fn generate<'a>(
        &'a mut self,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Result<ChunkStream<'a>> {
        let prompt = self.render_prompt(messages)?;

        // The rendered template already carries BOS when the model wants it.
        let tokens = self
            .tokenizer
            .encode(prompt.as_str(), false)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        if tokens.is_empty() {
            return Err(E::msg("Prompt produced no tokens"));
        }

        debug!(
            prompt_tokens = tokens.len(),
            max_new_tokens = params.max_new_tokens,
            in_session = self.in_session,
            "generation started"
        );

        let stream = GenerationStream::new(
            &mut self.model,
            &self.tokenizer,
            &self.device,
            &self.stop_token_ids,
            stop_markers(self.family),
            tokens,
            params,
        );
        Ok(Box::new(stream))
    }
}
