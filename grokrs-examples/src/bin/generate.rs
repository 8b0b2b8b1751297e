//! Text generation from a sharded Grok checkpoint on the CPU backend.
//!
//! Usage:
//!   # Single device, sampling:
//!   cargo run --release --bin generate -- -c /path/to/checkpoint "Hello"
//!   # Two model-parallel ranks, two data-parallel replicas, greedy:
//!   cargo run --release --bin generate -- -c ckpt --model-parallel 2 --data-parallel 2 --greedy "Hello"

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;

use grokrs::{DeviceMesh, GenerateOptions, Result, SamplingParams, Tokenizer as _};
use grokrs_cpu::CpuBackend;
use grokrs_examples::{init_logging, AnyTokenizer};
use grokrs_model::{load_config, load_sharded};
use grokrs_runtime::{Engine, Runtime};

/// Text generation with a Grok mixture-of-experts checkpoint
///
/// Loads the checkpoint onto a data x model device mesh (one CPU thread per
/// device). Looks for tokenizer.json next to the weights and falls back to
/// the byte vocabulary.
#[derive(Parser)]
#[command(name = "generate")]
struct Cli {
    /// Checkpoint directory (manifest.json + safetensors shards)
    #[arg(short, long, env = "GROKRS_CHECKPOINT")]
    checkpoint: PathBuf,

    /// Text prompt
    #[arg(default_value = "Hello")]
    prompt: String,

    /// tokenizer.json to use instead of the checkpoint's
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Maximum tokens to generate
    #[arg(short = 'n', long, default_value_t = 100)]
    max_tokens: usize,

    /// Use greedy (argmax) decoding instead of sampling
    #[arg(long)]
    greedy: bool,

    /// Sampling temperature
    #[arg(short, long, default_value_t = 0.7)]
    temperature: f32,

    /// Nucleus sampling threshold
    #[arg(short = 'p', long, default_value_t = 0.9)]
    top_p: f32,

    /// Keep only the k most likely tokens
    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    /// RNG seed for sampling
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Ranks each replica is sharded over
    #[arg(long, default_value_t = 1)]
    model_parallel: usize,

    /// Independent model replicas
    #[arg(long, default_value_t = 1)]
    data_parallel: usize,

    /// Cap on prompt plus output length (default: the model's)
    #[arg(long)]
    max_seq_len: Option<usize>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli.checkpoint)?;
    let mesh = DeviceMesh::new(cli.data_parallel, cli.model_parallel)?;
    tracing::info!(
        checkpoint = %cli.checkpoint.display(),
        layers = config.model.num_layers,
        emb = config.model.emb_size,
        experts = config.model.num_experts,
        vocab = config.vocab_size,
        data = mesh.data,
        model = mesh.model,
        "loading checkpoint"
    );

    let tokenizer = AnyTokenizer::discover(&cli.checkpoint, cli.tokenizer.as_deref())?;
    let replicas = load_sharded::<CpuBackend>(&cli.checkpoint, mesh)?;
    let engine = Engine::with_replicas(replicas, cli.max_seq_len)?;
    let runtime = Runtime::from_engine(engine, tokenizer)?;

    let options = GenerateOptions {
        max_new_tokens: cli.max_tokens,
        eos_token_id: None,
        sampling: if cli.greedy {
            None
        } else {
            Some(SamplingParams {
                temperature: cli.temperature,
                top_p: cli.top_p,
                top_k: cli.top_k,
                seed: cli.seed,
            })
        },
    };
    match &options.sampling {
        Some(p) => tracing::info!(
            temperature = p.temperature,
            top_p = p.top_p,
            top_k = ?p.top_k,
            seed = p.seed,
            "sampling"
        ),
        None => tracing::info!("greedy decoding"),
    }

    let prompt_len = runtime.tokenizer().encode(&cli.prompt, true)?.len();
    print!("{}", cli.prompt);
    io::stdout().flush()?;

    let start = Instant::now();
    let tokens = runtime.generate_stream(&cli.prompt, &options, &mut io::stdout())?;
    let elapsed = start.elapsed();
    println!();

    #[allow(clippy::cast_precision_loss)]
    let rate = tokens.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    tracing::info!(
        prompt_tokens = prompt_len,
        generated = tokens.len(),
        seconds = elapsed.as_secs_f64(),
        tokens_per_sec = rate,
        "done"
    );
    Ok(())
}
