use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Error as E, Result};
use serde_json::Value;
use tokenizers::Tokenizer;

use crate::prompting::PromptFamily;

/// The parts of a HF `tokenizer_config.json` the engine needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub(super) struct TokenizerConfig {
    pub chat_template: Option<String>,
    pub bos_token: Option<String>,
    pub eos_token: Option<String>,
}

pub(super) fn resolve_tokenizer_path(model_path: &Path, tokenizer_hint: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(hint) = tokenizer_hint {
        if hint.exists() {
            return Some(hint);
        }
    }

    let parent_dir = model_path.parent().unwrap_or(Path::new("."));
    let local_tok_path = parent_dir.join("tokenizer.json");
    if local_tok_path.exists() {
        return Some(local_tok_path);
    }

    let root_tok_path = Path::new("tokenizer.json");
    if root_tok_path.exists() {
        return Some(root_tok_path.to_path_buf());
    }

    None
}

pub(super) fn load_tokenizer_config(path: &Path) -> Result<TokenizerConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| E::msg(format!("Failed to read {}: {}", path.display(), e)))?;
    parse_tokenizer_config(&raw)
}

pub(super) fn parse_tokenizer_config(raw: &str) -> Result<TokenizerConfig> {
    let json: Value = serde_json::from_str(raw)?;

    // Special tokens are either plain strings or `{ "content": "..." }` objects.
    let token = |key: &str| match json.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Object(obj)) => obj.get("content").and_then(Value::as_str).map(str::to_string),
        _ => None,
    };

    // Some exports ship a list of named templates; the "default" one is used.
    let chat_template = match json.get("chat_template") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(items)) => items
            .iter()
            .find(|item| item.get("name").and_then(Value::as_str) == Some("default"))
            .and_then(|item| item.get("template"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    };

    Ok(TokenizerConfig {
        chat_template,
        bos_token: token("bos_token"),
        eos_token: token("eos_token"),
    })
}

/// Token ids that terminate an assistant turn for `family`.
pub(super) fn resolve_stop_tokens(
    tokenizer: &Tokenizer,
    family: PromptFamily,
    configured_eos: Option<&str>,
) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    let mut push = |token: &str| {
        if let Some(id) = tokenizer.token_to_id(token) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    };

    if let Some(eos) = configured_eos {
        push(eos);
    }

    match family {
        PromptFamily::Llama => {
            push("<|end_of_text|>");
            push("</s>");
            push("<|eot_id|>");
        }
        PromptFamily::Qwen => {
            push("<|endoftext|>");
            push("<|im_end|>");
            if tokenizer.token_to_id("<|im_start|>").is_none() {
                return Err(E::msg(
                    "Tokenizer/model incompatibility: Qwen template requires <|im_start|>.",
                ));
            }
        }
        PromptFamily::Mistral => {
            push("</s>");
        }
        PromptFamily::Unknown => {
            push("<|end_of_text|>");
            push("</s>");
            push("<|endoftext|>");
        }
    }

    if ids.is_empty() {
        return Err(E::msg(format!(
            "Tokenizer/model incompatibility: no end-of-sequence token found for {:?}.",
            family
        )));
    }

    Ok(ids)
}
