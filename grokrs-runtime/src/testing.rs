//! Deterministic stand-in model for runner and engine tests.

use grokrs::model::validate_input;
use grokrs::{KvCache, KvCacheOps, Model, ModelConfig, Result};
use grokrs_cpu::{CpuBackend, CpuKvCache, CpuLogits, CpuTensor};

/// Predicts `last + 1 (mod vocab)` after every position. EOS is token 2.
pub struct CountingModel {
    vocab_size: usize,
    max_seq_len: usize,
    flat: bool,
}

impl CountingModel {
    pub fn new(vocab_size: usize, max_seq_len: usize) -> Self {
        Self {
            vocab_size,
            max_seq_len,
            flat: false,
        }
    }

    /// Uniform logits, so sampling is decided by the RNG alone.
    pub fn with_flat_logits(mut self) -> Self {
        self.flat = true;
        self
    }

    fn logits(&self, ids: &[u32]) -> Result<CpuLogits> {
        let mut data = vec![0.0; ids.len() * self.vocab_size];
        if !self.flat {
            for (row, &id) in ids.iter().enumerate() {
                let next = (id as usize + 1) % self.vocab_size;
                data[row * self.vocab_size + next] = 10.0;
            }
        }
        CpuLogits::from_tensor(&CpuTensor::new(&[ids.len(), self.vocab_size], data)?)
    }
}

impl Model for CountingModel {
    type B = CpuBackend;
    type KvCache = CpuKvCache;

    fn config(&self) -> ModelConfig {
        ModelConfig {
            num_layers: 0,
            max_seq_len: self.max_seq_len,
            num_kv_heads: 1,
            head_dim: 1,
            vocab_size: self.vocab_size,
            eos_token_id: 2,
            pad_token_id: 0,
        }
    }

    fn allocate_kv_cache(&self, capacity: usize) -> Result<CpuKvCache> {
        CpuBackend::allocate_kv_cache(0, capacity, 1, 1)
    }

    fn forward(&self, input_ids: &[u32]) -> Result<CpuLogits> {
        validate_input(input_ids, self.vocab_size, 0, self.max_seq_len)?;
        self.logits(input_ids)
    }

    fn forward_prefill(&self, input_ids: &[u32], kv_cache: &mut CpuKvCache) -> Result<CpuLogits> {
        validate_input(input_ids, self.vocab_size, kv_cache.len(), kv_cache.capacity())?;
        CpuBackend::advance(kv_cache, input_ids.len())?;
        self.logits(&input_ids[input_ids.len() - 1..])
    }
}
