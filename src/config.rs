//! Pipeline configuration, loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Name of the per-model config file looked up next to the weights.
pub const CONFIG_FILE_NAME: &str = "genai_pipeline.toml";

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "GENAI_PIPELINE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub generation: GenerationDefaults,
    pub chat: ChatConfig,
    pub logging: LoggingConfig,
}

/// Values used for every option a `generate` call leaves out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    pub temperature: f64,
    pub top_p: f64,
    /// `None` disables top-k filtering.
    pub top_k: Option<usize>,
    pub seed: u64,
    pub max_new_tokens: usize,
    /// 1.0 = no penalty.
    pub repetition_penalty: f32,
    /// Window of generated tokens the penalty looks back over.
    pub repeat_last_n: usize,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: None,
            seed: 299_792_458,
            max_new_tokens: 500,
            repetition_penalty: 1.0,
            repeat_last_n: 64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Injected as the first message of every conversation.
    pub system_prompt: Option<String>,
    /// Oldest turns are dropped beyond this many messages (0 = unbounded).
    pub max_history_messages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
}

impl PipelineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    /// Resolves the config for a model: `$GENAI_PIPELINE_CONFIG` first,
    /// then `genai_pipeline.toml` in the model directory, then defaults.
    pub fn load_for_model(model_path: impl AsRef<Path>) -> Result<Self> {
        if let Some(explicit) = std::env::var_os(CONFIG_ENV_VAR) {
            return Self::from_file(PathBuf::from(explicit));
        }

        match config_path_for_model(model_path.as_ref()) {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

fn config_path_for_model(model_path: &Path) -> Option<PathBuf> {
    let dir = if model_path.is_dir() {
        model_path
    } else {
        model_path.parent()?
    };
    let candidate = dir.join(CONFIG_FILE_NAME);
    candidate.is_file().then_some(candidate)
}
