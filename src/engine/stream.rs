use anyhow::{Error as E, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use tokenizers::Tokenizer;

use crate::backend::RuntimeModel;
use crate::options::SamplingParams;

/// Incremental detokenizer.
///
/// Decoding token by token breaks multi-byte characters and merged spaces,
/// so text is only released once the decoded suffix ends on an alphanumeric
/// character; the remainder is flushed by [`TokenOutputStream::decode_rest`].
pub(super) struct TokenOutputStream<'a> {
    tokenizer: &'a Tokenizer,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl<'a> TokenOutputStream<'a> {
    pub(super) fn new(tokenizer: &'a Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer.decode(tokens, true).map_err(E::msg)
    }

    pub(super) fn next_token(&mut self, token: u32) -> Result<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        self.tokens.push(token);
        let text = self.decode(&self.tokens[self.prev_index..])?;

        if text.len() > prev_text.len() && text.chars().last().is_some_and(char::is_alphanumeric) {
            let fresh = text.get(prev_text.len()..).unwrap_or_default().to_string();
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            Ok(Some(fresh))
        } else {
            Ok(None)
        }
    }

    pub(super) fn decode_rest(&mut self) -> Result<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        let text = self.decode(&self.tokens[self.prev_index..])?;
        self.prev_index = self.current_index;
        self.current_index = self.tokens.len();

        if text.len() > prev_text.len() {
            Ok(text.get(prev_text.len()..).map(str::to_string))
        } else {
            Ok(None)
        }
    }
}

/// Token-by-token generation over a borrowed model.
///
/// The first step feeds the whole prompt at position 0, which also resets the
/// model's KV cache; every later step feeds only the last sampled token.
pub(super) struct GenerationStream<'a> {
    model: &'a mut RuntimeModel,
    device: &'a Device,
    decoder: TokenOutputStream<'a>,
    logits_processor: LogitsProcessor,
    stop_token_ids: &'a [u32],
    stop_filter: StopFilter,
    max_new_tokens: usize,
    repetition_penalty: f32,
    repeat_last_n: usize,
    next_input: Vec<u32>,
    generated_tokens: Vec<u32>,
    index_pos: usize,
    finished: bool,
}

impl<'a> GenerationStream<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        model: &'a mut RuntimeModel,
        tokenizer: &'a Tokenizer,
        device: &'a Device,
        stop_token_ids: &'a [u32],
        stop_markers: &[&str],
        prompt_tokens: Vec<u32>,
        params: &SamplingParams,
    ) -> Self {
        let mut stop_strings = params.stop_strings.clone();
        stop_strings.extend(stop_markers.iter().map(|m| m.to_string()));
        stop_strings.retain(|s| !s.is_empty());

        Self {
            model,
            device,
            decoder: TokenOutputStream::new(tokenizer),
            logits_processor: LogitsProcessor::from_sampling(params.seed, sampling_for(params)),
            stop_token_ids,
            stop_filter: StopFilter::new(stop_strings),
            max_new_tokens: params.max_new_tokens,
            repetition_penalty: params.repetition_penalty,
            repeat_last_n: params.repeat_last_n,
            next_input: prompt_tokens,
            generated_tokens: Vec::new(),
            index_pos: 0,
            finished: false,
        }
    }

    fn step(&mut self) -> Result<String> {
        if self.generated_tokens.len() >= self.max_new_tokens {
            self.finished = true;
            let rest = self.decoder.decode_rest()?.unwrap_or_default();
            return Ok(self.release(&rest));
        }

        let input = Tensor::new(self.next_input.as_slice(), self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, self.index_pos)?;
        self.index_pos += self.next_input.len();

        let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
        let logits = if (self.repetition_penalty - 1.0).abs() > f32::EPSILON {
            let start = self.generated_tokens.len().saturating_sub(self.repeat_last_n);
            candle_transformers::utils::apply_repeat_penalty(
                &logits,
                self.repetition_penalty,
                &self.generated_tokens[start..],
            )?
        } else {
            logits
        };

        let next_token = self.logits_processor.sample(&logits)?;

        if self.stop_token_ids.contains(&next_token) {
            self.finished = true;
            let rest = self.decoder.decode_rest()?.unwrap_or_default();
            return Ok(self.release(&rest));
        }

        self.generated_tokens.push(next_token);
        self.next_input = vec![next_token];

        let mut text = self.decoder.next_token(next_token)?.unwrap_or_default();
        if self.generated_tokens.len() >= self.max_new_tokens {
            self.finished = true;
            if let Some(rest) = self.decoder.decode_rest()? {
                text.push_str(&rest);
            }
        }

        Ok(self.release(&text))
    }

    fn release(&mut self, text: &str) -> String {
        let (chunk, stopped) = self.stop_filter.push(text, self.finished);
        if stopped {
            self.finished = true;
        }
        chunk
    }
}

impl Iterator for GenerationStream<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            match self.step() {
                Ok(chunk) if chunk.is_empty() => continue,
                Ok(chunk) => return Some(Ok(chunk)),
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Cuts streamed text at the first stop string.
///
/// A tail that could still grow into a stop string is held back until the
/// next chunk settles it, so a marker split across chunks never leaks.
#[derive(Debug, Default)]
pub(super) struct StopFilter {
    stop_strings: Vec<String>,
    pending: String,
}

impl StopFilter {
    pub(super) fn new(stop_strings: Vec<String>) -> Self {
        Self {
            stop_strings,
            pending: String::new(),
        }
    }

    /// Returns the text that may be delivered and whether a stop string was
    /// hit. `last` flushes whatever is held back.
    pub(super) fn push(&mut self, text: &str, last: bool) -> (String, bool) {
        self.pending.push_str(text);

        if let Some(cut) = first_stop(&self.pending, &self.stop_strings) {
            self.pending.truncate(cut);
            return (std::mem::take(&mut self.pending), true);
        }
        if last {
            return (std::mem::take(&mut self.pending), false);
        }

        let keep_from = partial_stop_start(&self.pending, &self.stop_strings);
        let held = self.pending.split_off(keep_from);
        (std::mem::replace(&mut self.pending, held), false)
    }
}

fn first_stop(text: &str, stop_strings: &[String]) -> Option<usize> {
    stop_strings.iter().filter_map(|s| text.find(s.as_str())).min()
}

/// Start of the longest suffix of `text` that is a proper prefix of some
/// stop string, or `text.len()` when there is none.
fn partial_stop_start(text: &str, stop_strings: &[String]) -> usize {
    text.char_indices()
        .map(|(i, _)| i)
        .find(|&i| {
            let tail = &text[i..];
            stop_strings
                .iter()
                .any(|s| s.len() > tail.len() && s.starts_with(tail))
        })
        .unwrap_or(text.len())
}

fn sampling_for(params: &SamplingParams) -> Sampling {
    if params.is_greedy() {
        return Sampling::ArgMax;
    }

    let temperature = params.temperature;
    match (params.top_k, params.top_p) {
        (None, None) => Sampling::All { temperature },
        (Some(k), None) => Sampling::TopK { k, temperature },
        (None, Some(p)) => Sampling::TopP { p, temperature },
        (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
    }
}
