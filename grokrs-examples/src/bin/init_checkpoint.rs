//! Write a randomly initialised checkpoint, for smoke tests and benchmarks.
//!
//! Usage:
//!   # Small byte-vocabulary model saved for two model-parallel ranks:
//!   cargo run --bin init_checkpoint -- -o /tmp/grok-tiny --model-parallel 2
//!   # Any configuration, e.g. one edited from a saved manifest:
//!   cargo run --bin init_checkpoint -- -o /tmp/grok-custom --config config.json

use std::path::PathBuf;

use clap::Parser;

use grokrs::{ByteTokenizer, DeviceMesh, Result};
use grokrs_examples::init_logging;
use grokrs_model::{init_random_weights, write_checkpoint, LanguageModelConfig, TransformerConfig};

/// Write a random checkpoint
#[derive(Parser)]
#[command(name = "init_checkpoint")]
struct Cli {
    /// Output directory
    #[arg(short, long)]
    output: PathBuf,

    /// Language model config JSON (default: a small byte-vocabulary model)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Weight initialisation seed
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Model-axis size the shards are written for
    #[arg(long, default_value_t = 1)]
    model_parallel: usize,

    /// Store expert weights as int8 with per-channel scales
    #[arg(long)]
    quantize_experts: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn small_config() -> Result<LanguageModelConfig> {
    LanguageModelConfig::new(
        TransformerConfig {
            emb_size: 256,
            widening_factor: 8.0,
            key_size: 32,
            num_q_heads: 8,
            num_kv_heads: 2,
            num_layers: 4,
            attn_output_multiplier: 0.176_776_7,
            shard_activations: true,
            num_experts: 8,
            num_selected_experts: 2,
            data_axis: "data".into(),
            model_axis: "model".into(),
            rope_base: 10000.0,
            norm_eps: 1e-5,
            attn_logit_softcap: Some(30.0),
        },
        ByteTokenizer::VOCAB_SIZE,
        ByteTokenizer::PAD,
        ByteTokenizer::EOS,
        1024,
    )
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => LanguageModelConfig::from_file(path)?,
        None => small_config()?,
    };
    let mesh = DeviceMesh::new(1, cli.model_parallel)?;
    config.model.validate_for_mesh(&mesh)?;

    tracing::info!(
        layers = config.model.num_layers,
        emb = config.model.emb_size,
        ffn = config.model.ffn_size(),
        experts = config.model.num_experts,
        vocab = config.vocab_size,
        seed = cli.seed,
        "initialising weights"
    );
    let weights = init_random_weights(&config, cli.seed);
    let manifest = write_checkpoint(&cli.output, &config, &weights, mesh, cli.quantize_experts)?;
    tracing::info!(
        output = %cli.output.display(),
        tensors = manifest.tensors.len(),
        "checkpoint written"
    );
    Ok(())
}
