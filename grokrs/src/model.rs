//! Model trait for LLM inference
//!
//! Defines the interface a language model must satisfy to be driven by the
//! inference runner and engine.

use crate::backend::{Backend, KvCache};
use crate::Result;

/// Configuration needed by the runner to allocate resources and validate input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    /// Number of transformer layers
    pub num_layers: usize,
    /// Maximum sequence length the model supports
    pub max_seq_len: usize,
    /// Number of key-value heads held by one replica
    pub num_kv_heads: usize,
    /// Dimension of each attention head
    pub head_dim: usize,
    /// Number of logits per position
    pub vocab_size: usize,
    /// End-of-sequence token ID
    pub eos_token_id: u32,
    /// Padding token ID
    pub pad_token_id: u32,
}

/// Trait for language models that can be driven by the runner.
///
/// A model takes token IDs, runs a forward pass, and returns logits (always
/// f32, already carrying the output scale). It supports both full recompute
/// and KV-cached inference; both paths must agree.
pub trait Model: Send + Sync {
    /// The compute backend.
    type B: Backend;

    /// Per-sequence cache type.
    type KvCache: KvCache;

    /// Get the model configuration.
    fn config(&self) -> ModelConfig;

    /// Allocate an empty cache holding up to `capacity` positions.
    ///
    /// # Errors
    /// Returns an error if `capacity` exceeds `max_seq_len` or allocation fails.
    fn allocate_kv_cache(&self, capacity: usize) -> Result<Self::KvCache>;

    /// Full forward pass without a cache.
    ///
    /// Returns logits of shape (`seq_len`, `vocab_size`), one row per input
    /// position.
    ///
    /// # Errors
    /// Returns an error on empty or out-of-vocabulary input, or if the input
    /// is longer than `max_seq_len`.
    fn forward(&self, input_ids: &[u32]) -> Result<<Self::B as Backend>::Logits>;

    /// Forward pass with KV cache (prefill phase).
    ///
    /// Processes all input tokens starting at the cache's current length,
    /// appends their keys and values, and returns logits for the **last**
    /// token only: shape (1, `vocab_size`).
    ///
    /// # Errors
    /// Returns an error on empty or out-of-vocabulary input, or
    /// [`Error::SequenceTooLong`](crate::Error::SequenceTooLong) if the cache
    /// would overflow. The cache is unchanged on error.
    fn forward_prefill(
        &self,
        input_ids: &[u32],
        kv_cache: &mut Self::KvCache,
    ) -> Result<<Self::B as Backend>::Logits>;

    /// Forward pass for a single token with KV cache (decode phase).
    ///
    /// Appends the token's keys and values and returns logits of shape
    /// (1, `vocab_size`).
    ///
    /// # Errors
    /// Same as [`Self::forward_prefill`].
    fn forward_decode(
        &self,
        token_id: u32,
        kv_cache: &mut Self::KvCache,
    ) -> Result<<Self::B as Backend>::Logits> {
        self.forward_prefill(&[token_id], kv_cache)
    }
}

/// Check ids against the vocabulary and the remaining cache room before any
/// work is dispatched.
///
/// # Errors
/// Returns [`Error::InvalidRequest`](crate::Error::InvalidRequest) on empty
/// input, [`Error::OutOfVocabulary`](crate::Error::OutOfVocabulary) on a bad
/// id and [`Error::SequenceTooLong`](crate::Error::SequenceTooLong) if
/// `filled + ids.len()` exceeds `capacity`.
pub fn validate_input(
    ids: &[u32],
    vocab_size: usize,
    filled: usize,
    capacity: usize,
) -> Result<()> {
    if ids.is_empty() {
        return Err(crate::Error::InvalidRequest("empty input".into()));
    }
    if let Some(&token) = ids.iter().find(|&&id| id as usize >= vocab_size) {
        return Err(crate::Error::OutOfVocabulary { token, vocab_size });
    }
    let len = filled + ids.len();
    if len > capacity {
        return Err(crate::Error::SequenceTooLong { len, max: capacity });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_validate_input() {
        assert!(validate_input(&[1, 2], 10, 0, 4).is_ok());
        assert!(matches!(
            validate_input(&[], 10, 0, 4),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            validate_input(&[1, 10], 10, 0, 4),
            Err(Error::OutOfVocabulary {
                token: 10,
                vocab_size: 10
            })
        ));
        assert!(matches!(
            validate_input(&[1, 2], 10, 3, 4),
            Err(Error::SequenceTooLong { len: 5, max: 4 })
        ));
    }
}
