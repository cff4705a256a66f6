//! Interactive chat loop behind the `chat_sample` binary.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use tracing::debug;

use crate::options::GenerationOptions;
use crate::pipeline::PipelineController;

pub const QUESTION_PROMPT: &str = "question:";
pub const TURN_SEPARATOR: &str = "\n----------\n";

/// Reads one question per line from `input` until EOF and streams each reply
/// to `output`. The chat must already be started; it is finished on EOF.
///
/// Blank lines are skipped. Returns the number of answered questions.
pub fn run_chat<R, W>(
    pipeline: &PipelineController,
    input: R,
    output: &mut W,
    options: &GenerationOptions,
) -> Result<usize>
where
    R: BufRead,
    W: Write,
{
    writeln!(output, "{}", QUESTION_PROMPT)?;
    output.flush()?;

    let mut answered = 0;
    for line in input.lines() {
        let line = line.context("failed to read question")?;
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }

        pipeline.generate_text(prompt, options.clone(), |chunk| {
            output.write_all(chunk.as_bytes())?;
            output.flush()?;
            Ok(())
        })?;
        answered += 1;

        writeln!(output, "{}{}", TURN_SEPARATOR, QUESTION_PROMPT)?;
        output.flush()?;
    }

    debug!(answered, "input closed, finishing chat");
    pipeline.finish_chat()?;
    Ok(answered)
}
