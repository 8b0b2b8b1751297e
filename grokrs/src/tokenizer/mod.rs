//! Tokenizer integration
//!
//! Defines the [`Tokenizer`] trait and concrete implementations. The
//! inference core only ever sees token ids; text enters and leaves through
//! this trait.

mod byte_tokenizer;
mod hf_tokenizer;

use crate::Result;

pub use byte_tokenizer::ByteTokenizer;
pub use hf_tokenizer::HfTokenizer;

/// Trait for tokenizers that convert between text and token IDs.
pub trait Tokenizer {
    /// Encode text to token IDs.
    ///
    /// # Arguments
    /// * `text` - The text to encode
    /// * `add_bos` - Whether to prepend the beginning-of-sequence token
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<u32>>;

    /// Decode token IDs to text.
    ///
    /// # Errors
    /// Returns an error if decoding fails.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Decode a single token ID to text.
    ///
    /// # Errors
    /// Returns an error if decoding fails.
    fn decode_token(&self, id: u32) -> Result<String> {
        self.decode(&[id])
    }

    /// Get the end-of-sequence token ID.
    fn eos_token_id(&self) -> u32;

    /// Get the padding token ID.
    fn pad_token_id(&self) -> u32;

    /// Number of ids the tokenizer can produce.
    fn vocab_size(&self) -> usize;
}
