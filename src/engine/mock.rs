//! Scripted engine for tests and dry runs.
//!
//! Replies are picked by prompt substring and streamed one word per chunk;
//! each chunk counts as one generated token against `max_new_tokens`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Error as E, Result};

use crate::options::SamplingParams;
use crate::prompting::{ChatMessage, Role};

use super::{ChunkStream, DeviceSelector, InferenceBackend, InferenceEngine};

/// Calls observed by every engine a [`MockBackend`] has loaded.
#[derive(Debug, Clone, Default)]
pub struct MockStats {
    pub loads: Vec<(PathBuf, String)>,
    pub sessions_begun: usize,
    pub sessions_ended: usize,
    /// Messages passed to each `generate` call, in order.
    pub generations: Vec<Vec<ChatMessage>>,
    /// Sampling parameters of each `generate` call.
    pub params: Vec<SamplingParams>,
    pub engines_released: usize,
}

#[derive(Debug, Clone)]
struct ReplyRule {
    needle: String,
    reply: String,
}

#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    rules: Vec<ReplyRule>,
    load_error: Option<String>,
    fail_after_chunks: Option<usize>,
    stats: Arc<Mutex<MockStats>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers `reply` when the latest user message contains `needle`.
    pub fn reply_when(mut self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rules.push(ReplyRule {
            needle: needle.into(),
            reply: reply.into(),
        });
        self
    }

    pub fn fail_load(mut self, message: impl Into<String>) -> Self {
        self.load_error = Some(message.into());
        self
    }

    /// The stream yields an error after `chunks` successful chunks.
    pub fn fail_after(mut self, chunks: usize) -> Self {
        self.fail_after_chunks = Some(chunks);
        self
    }

    pub fn stats(&self) -> MockStats {
        lock_stats(&self.stats).clone()
    }
}

impl InferenceBackend for MockBackend {
    fn load(&self, model_path: &Path, device: &str) -> Result<Box<dyn InferenceEngine>> {
        let _: DeviceSelector = device.parse()?;
        if let Some(message) = &self.load_error {
            return Err(E::msg(message.clone()));
        }

        lock_stats(&self.stats)
            .loads
            .push((model_path.to_path_buf(), device.to_string()));

        Ok(Box::new(MockEngine {
            rules: self.rules.clone(),
            fail_after_chunks: self.fail_after_chunks,
            stats: Arc::clone(&self.stats),
        }))
    }
}

#[derive(Debug)]
pub struct MockEngine {
    rules: Vec<ReplyRule>,
    fail_after_chunks: Option<usize>,
    stats: Arc<Mutex<MockStats>>,
}

impl MockEngine {
    fn reply_for(&self, messages: &[ChatMessage]) -> String {
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        self.rules
            .iter()
            .find(|rule| prompt.contains(&rule.needle))
            .map(|rule| rule.reply.clone())
            .unwrap_or_else(|| format!("You said: {}", prompt))
    }
}

impl InferenceEngine for MockEngine {
    fn begin_session(&mut self) -> Result<()> {
        lock_stats(&self.stats).sessions_begun += 1;
        Ok(())
    }

    fn end_session(&mut self) -> Result<()> {
        lock_stats(&self.stats).sessions_ended += 1;
        Ok(())
    }

    fn generate<'a>(
        &'a mut self,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Result<ChunkStream<'a>> {
        {
            let mut stats = lock_stats(&self.stats);
            stats.generations.push(messages.to_vec());
            stats.params.push(params.clone());
        }

        let mut chunks = split_words(&self.reply_for(messages));
        chunks.truncate(params.max_new_tokens);

        let fail_after = self.fail_after_chunks;
        let stream = chunks.into_iter().enumerate().map(move |(i, chunk)| match fail_after {
            Some(limit) if i >= limit => Err(E::msg("mock engine failure")),
            _ => Ok(chunk),
        });
        Ok(Box::new(stream))
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        lock_stats(&self.stats).engines_released += 1;
    }
}

fn lock_stats(stats: &Mutex<MockStats>) -> MutexGuard<'_, MockStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Splits text into words, each carrying its leading whitespace.
fn split_words(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if ch.is_whitespace() && !current.trim().is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}
