//! `tokenizer.json` tokenizer using the `tokenizers` crate

use std::path::Path;

use crate::{Error, Result};

/// Wrapper around a `tokenizers` model, e.g. a converted SentencePiece
/// vocabulary with `[PAD]` / `[BOS]` / `[EOS]` specials.
pub struct HfTokenizer {
    tokenizer: tokenizers::Tokenizer,
    pad_token_id: u32,
    bos_token_id: u32,
    eos_token_id: u32,
}

impl HfTokenizer {
    /// Load `tokenizer.json` from a file or from a directory containing one.
    ///
    /// # Errors
    /// Returns an error if the tokenizer cannot be loaded
    pub fn from_pretrained(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = if path.is_dir() {
            path.join("tokenizer.json")
        } else {
            path.to_path_buf()
        };
        if !file.exists() {
            return Err(Error::Tokenizer(format!(
                "No tokenizer.json found at {}",
                path.display()
            )));
        }
        let tokenizer =
            tokenizers::Tokenizer::from_file(&file).map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(Self::from_tokenizer(tokenizer))
    }

    /// Wrap an already constructed tokenizer.
    #[must_use]
    pub fn from_tokenizer(tokenizer: tokenizers::Tokenizer) -> Self {
        let lookup = |names: &[&str], default: u32| {
            names
                .iter()
                .find_map(|n| tokenizer.token_to_id(n))
                .unwrap_or(default)
        };
        let pad_token_id = lookup(&["[PAD]", "<pad>"], 0);
        let bos_token_id = lookup(&["[BOS]", "<s>", "<bos>"], 1);
        let eos_token_id = lookup(&["[EOS]", "</s>", "<eos>"], 2);
        Self {
            tokenizer,
            pad_token_id,
            bos_token_id,
            eos_token_id,
        }
    }

    /// Get the BOS token ID
    #[must_use]
    pub fn bos_token_id(&self) -> u32 {
        self.bos_token_id
    }
}

impl super::Tokenizer for HfTokenizer {
    fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        let mut ids: Vec<u32> = encoding.get_ids().to_vec();
        if add_bos {
            ids.insert(0, self.bos_token_id);
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}
