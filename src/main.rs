use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use genai_pipeline::logging::init_logging;
use genai_pipeline::sample::run_chat;
use genai_pipeline::{CandleBackend, GenerationOptions, PipelineConfig, PipelineController};

#[derive(Parser, Debug)]
#[command(name = "chat_sample")]
#[command(about = "Interactive chat over a local GGUF model")]
struct Args {
    /// Model directory or .gguf file
    model_dir: PathBuf,

    /// Device selector: AUTO, CPU, GPU, GPU.<n>, CUDA:<n> or METAL
    #[arg(long, default_value = "CPU")]
    device: String,

    /// Maximum tokens to generate per answer
    #[arg(long, default_value = "100")]
    max_new_tokens: usize,

    /// Pipeline config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::load_for_model(&args.model_dir)?,
    };
    init_logging(&config.logging);

    let pipeline = PipelineController::with_backend(
        "LLMPipeline",
        &args.model_dir,
        &args.device,
        Arc::new(CandleBackend),
        config,
    )?;
    pipeline.init()?;
    pipeline.start_chat()?;

    let options = GenerationOptions::default().with_max_new_tokens(args.max_new_tokens);
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    run_chat(&pipeline, stdin.lock(), &mut stdout, &options)?;

    Ok(())
}
