use minijinja::{context, Environment, Error as TemplateError, ErrorKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptFamily {
    Llama,
    Qwen,
    Mistral,
    Unknown,
}

impl PromptFamily {
    /// Maps a GGUF `general.architecture` value or a model name to a family.
    pub fn infer(name: &str) -> Self {
        let lowered = name.to_lowercase();
        if lowered.contains("llama") {
            PromptFamily::Llama
        } else if lowered.contains("qwen") {
            PromptFamily::Qwen
        } else if lowered.contains("mistral") || lowered.contains("mixtral") {
            PromptFamily::Mistral
        } else {
            PromptFamily::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Text markers that end an assistant turn even if the tokenizer does not
/// map them to a special token id.
pub fn stop_markers(family: PromptFamily) -> &'static [&'static str] {
    match family {
        PromptFamily::Llama => &["<|eot_id|>", "<|end_of_text|>"],
        PromptFamily::Qwen => &["<|im_end|>", "<|endoftext|>"],
        PromptFamily::Mistral => &["</s>"],
        PromptFamily::Unknown => &[],
    }
}

/// Renders a conversation with the built-in format of `family`, ending with
/// an open assistant turn.
pub fn format_conversation(messages: &[ChatMessage], family: PromptFamily) -> String {
    let mut out = String::new();

    match family {
        PromptFamily::Llama => {
            out.push_str("<|begin_of_text|>");
            for msg in messages {
                out.push_str(&format!(
                    "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                    role_name(msg.role),
                    msg.content
                ));
            }
            out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
        }
        PromptFamily::Qwen => {
            for msg in messages {
                out.push_str(&format!(
                    "<|im_start|>{}\n{}<|im_end|>\n",
                    role_name(msg.role),
                    msg.content
                ));
            }
            out.push_str("<|im_start|>assistant\n");
        }
        PromptFamily::Mistral => {
            out.push_str("<s>");
            let mut pending_system: Option<&str> = None;
            for msg in messages {
                match msg.role {
                    Role::System => pending_system = Some(msg.content.as_str()),
                    Role::User => match pending_system.take() {
                        Some(system) => {
                            out.push_str(&format!("[INST] {}\n\n{} [/INST]", system, msg.content))
                        }
                        None => out.push_str(&format!("[INST] {} [/INST]", msg.content)),
                    },
                    Role::Assistant => out.push_str(&format!("{}</s>", msg.content)),
                }
            }
        }
        PromptFamily::Unknown => {
            for msg in messages {
                out.push_str(&format!(
                    "[{}]\n{}\n[/{}]\n",
                    role_name(msg.role),
                    msg.content,
                    role_name(msg.role)
                ));
            }
            out.push_str("[assistant]\n");
        }
    }

    out
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// A model-provided Jinja chat template (`tokenizer_config.json` or GGUF
/// `tokenizer.chat_template`).
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    source: String,
    bos_token: String,
    eos_token: String,
}

impl ChatTemplate {
    pub fn new(
        source: impl Into<String>,
        bos_token: impl Into<String>,
        eos_token: impl Into<String>,
    ) -> Self {
        Self {
            source: preprocess_template(&source.into()),
            bos_token: bos_token.into(),
            eos_token: eos_token.into(),
        }
    }

    pub fn render(&self, messages: &[ChatMessage]) -> Result<String, TemplateError> {
        let mut env = Environment::new();
        env.add_function("raise_exception", |msg: String| -> Result<String, TemplateError> {
            Err(TemplateError::new(ErrorKind::InvalidOperation, msg))
        });
        env.add_template("chat", &self.source)?;

        env.get_template("chat")?.render(context! {
            messages => messages,
            add_generation_prompt => true,
            bos_token => &self.bos_token,
            eos_token => &self.eos_token,
        })
    }
}

/// Rewrites the Python-only string methods HF templates use into their
/// minijinja equivalents.
fn preprocess_template(template: &str) -> String {
    template
        .replace("tojson(ensure_ascii=False)", "tojson")
        .replace(".strip()", " | trim")
        .replace(".startswith(", " is startingwith(")
        .replace(".endswith(", " is endingwith(")
        .replace(".items()", " | items")
}
