//! Chat session state owned by a pipeline controller.

use crate::config::ChatConfig;
use crate::error::{PipelineError, Result};
use crate::prompting::{ChatMessage, Role};

/// Conversation state for one controller.
///
/// Starts inactive. While active, every committed turn is kept so the engine
/// can condition on it; a turn is only committed once its reply is complete.
#[derive(Debug, Default)]
pub struct ChatSession {
    active: bool,
    history: Vec<ChatMessage>,
    config: ChatConfig,
}

impl ChatSession {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            active: false,
            history: Vec::new(),
            config,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn start(&mut self) -> Result<()> {
        if self.active {
            return Err(PipelineError::ChatAlreadyStarted);
        }
        self.active = true;
        self.history.clear();
        if let Some(system) = &self.config.system_prompt {
            self.history.push(ChatMessage::system(system.clone()));
        }
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        if !self.active {
            return Err(PipelineError::ChatNotStarted);
        }
        self.active = false;
        self.history.clear();
        Ok(())
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Messages the engine should see for `prompt`, without mutating history.
    pub fn messages_for(&self, prompt: &str) -> Vec<ChatMessage> {
        let mut messages = if self.active {
            self.history.clone()
        } else {
            self.config
                .system_prompt
                .iter()
                .map(|s| ChatMessage::system(s.clone()))
                .collect()
        };
        messages.push(ChatMessage::user(prompt));
        messages
    }

    /// Records a completed exchange. No-op outside an active chat.
    pub fn commit_turn(&mut self, prompt: &str, reply: &str) {
        if !self.active {
            return;
        }
        self.history.push(ChatMessage::user(prompt));
        self.history.push(ChatMessage::assistant(reply));
        self.trim_history();
    }

    fn trim_history(&mut self) {
        let limit = self.config.max_history_messages;
        if limit == 0 {
            return;
        }

        while self.turn_messages() > limit {
            self.drop_oldest_turn();
        }
    }

    /// Removes the oldest user message and the replies that follow it, so
    /// the kept history still opens on a user turn.
    fn drop_oldest_turn(&mut self) {
        let Some(first) = self.history.iter().position(|m| m.role != Role::System) else {
            return;
        };
        self.history.remove(first);
        while self
            .history
            .get(first)
            .is_some_and(|m| m.role == Role::Assistant)
        {
            self.history.remove(first);
        }
    }

    fn turn_messages(&self) -> usize {
        self.history.iter().filter(|m| m.role != Role::System).count()
    }
}
