//! Shared plumbing for the grokrs command-line tools.

use std::path::Path;

use grokrs::{ByteTokenizer, HfTokenizer, Result};
use tracing_subscriber::EnvFilter;

/// Install the stderr log subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Either a `tokenizer.json` vocabulary or the built-in byte vocabulary.
pub enum AnyTokenizer {
    HuggingFace(HfTokenizer),
    Bytes(ByteTokenizer),
}

impl AnyTokenizer {
    /// Use `path` if given, else `tokenizer.json` in the checkpoint
    /// directory if present, else bytes.
    ///
    /// # Errors
    /// Returns an error if an explicit or discovered `tokenizer.json` fails
    /// to load.
    pub fn discover(checkpoint: &Path, path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Ok(Self::HuggingFace(HfTokenizer::from_pretrained(path)?));
        }
        if checkpoint.join("tokenizer.json").exists() {
            return Ok(Self::HuggingFace(HfTokenizer::from_pretrained(checkpoint)?));
        }
        tracing::info!("no tokenizer.json found, using the byte vocabulary");
        Ok(Self::Bytes(ByteTokenizer::new()))
    }
}

impl grokrs::Tokenizer for AnyTokenizer {
    fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<u32>> {
        match self {
            Self::HuggingFace(t) => t.encode(text, add_bos),
            Self::Bytes(t) => t.encode(text, add_bos),
        }
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        match self {
            Self::HuggingFace(t) => t.decode(ids),
            Self::Bytes(t) => t.decode(ids),
        }
    }

    fn eos_token_id(&self) -> u32 {
        match self {
            Self::HuggingFace(t) => t.eos_token_id(),
            Self::Bytes(t) => t.eos_token_id(),
        }
    }

    fn pad_token_id(&self) -> u32 {
        match self {
            Self::HuggingFace(t) => t.pad_token_id(),
            Self::Bytes(t) => t.pad_token_id(),
        }
    }

    fn vocab_size(&self) -> usize {
        match self {
            Self::HuggingFace(t) => t.vocab_size(),
            Self::Bytes(t) => t.vocab_size(),
        }
    }
}
