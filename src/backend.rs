use std::fs::File;
use std::path::Path;

use anyhow::{Error as E, Result};
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;

use crate::prompting::PromptFamily;

pub enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

/// Metadata read from the GGUF header before the weights are loaded.
#[derive(Debug, Clone, Default)]
pub struct GgufInfo {
    pub architecture: Option<String>,
    pub chat_template: Option<String>,
}

impl RuntimeModel {
    /// Loads the weights at `path`. `family` may be `Unknown`, in which case the
    /// GGUF `general.architecture` key decides.
    pub fn load_from_gguf(
        path: &Path,
        family: PromptFamily,
        device: &Device,
    ) -> Result<(Self, PromptFamily, GgufInfo)> {
        let mut file = File::open(path)
            .map_err(|e| E::msg(format!("Failed to open model file {}: {}", path.display(), e)))?;
        let content = gguf_file::Content::read(&mut file)?;
        let info = read_info(&content);

        let family = match (family, info.architecture.as_deref()) {
            (PromptFamily::Unknown, Some(arch)) => PromptFamily::infer(arch),
            (family, _) => family,
        };

        let model = match family {
            // Mistral GGUF exports use the llama architecture.
            PromptFamily::Llama | PromptFamily::Mistral => {
                let model = quantized_llama::ModelWeights::from_gguf(content, &mut file, device)?;
                Self::Llama(model)
            }
            PromptFamily::Qwen => {
                match quantized_qwen2::ModelWeights::from_gguf(content, &mut file, device) {
                    Ok(model) => Self::Qwen2(model),
                    Err(e) => {
                        let msg = format!("{}", e);
                        if msg.contains("cannot find tensor info for output_norm.weight") {
                            return Err(E::msg(
                                "Qwen load failed: missing 'output_norm.weight'. The GGUF is likely an incomplete split shard. Use a full single-file GGUF, or merge all split parts first.",
                            ));
                        }
                        return Err(E::msg(msg));
                    }
                }
            }
            PromptFamily::Unknown => {
                return Err(E::msg(format!(
                    "Unknown model family for {}: cannot choose runtime backend.",
                    path.display()
                )))
            }
        };

        Ok((model, family, info))
    }

    pub fn forward(&mut self, input_tensor: &Tensor, position: usize) -> Result<Tensor> {
        match self {
            Self::Llama(model) => Ok(model.forward(input_tensor, position)?),
            Self::Qwen2(model) => Ok(model.forward(input_tensor, position)?),
        }
    }
}

fn read_info(content: &gguf_file::Content) -> GgufInfo {
    let string_key = |key: &str| {
        content
            .metadata
            .get(key)
            .and_then(|v| v.to_string().ok())
            .cloned()
    };

    GgufInfo {
        architecture: string_key("general.architecture"),
        chat_template: string_key("tokenizer.chat_template"),
    }
}
