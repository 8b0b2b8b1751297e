//! Grouped-query self-attention over one model-axis shard.
//!
//! Each rank holds a contiguous group of query heads together with the
//! key/value heads they share, so attention itself needs no communication.
//! The output projection is row-parallel: the returned tensor is this rank's
//! partial sum and must be reduced across the model axis by the caller.

#![allow(clippy::cast_precision_loss)]

use grokrs::rope::precompute_rope_data;
use grokrs::{Backend, Result, Tensor};

use crate::GrokOps;

/// Rotary cos/sin tables, `[max_seq_len, head_dim / 2]`.
pub struct RopeTables<B: Backend> {
    pub cos: B::Tensor,
    pub sin: B::Tensor,
}

impl<B: GrokOps> RopeTables<B> {
    /// # Errors
    /// Returns an error if `head_dim` is odd or zero.
    pub fn new(max_seq_len: usize, head_dim: usize, base: f32) -> Result<Self> {
        let (cos, sin) = precompute_rope_data(max_seq_len, head_dim, base)?;
        let shape = [max_seq_len, head_dim / 2];
        Ok(Self {
            cos: B::from_f32_slice(&shape, &cos)?,
            sin: B::from_f32_slice(&shape, &sin)?,
        })
    }
}

/// This rank's attention weights and head geometry.
pub struct AttentionBlock<B: Backend> {
    /// `[emb, local_heads * head_dim]`
    pub query: B::Tensor,
    /// `[emb, local_kv_heads * head_dim]`
    pub key: B::Tensor,
    pub value: B::Tensor,
    /// `[local_heads * head_dim, emb]`
    pub linear: B::Tensor,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub output_multiplier: f32,
    pub softcap: Option<f32>,
}

impl<B: GrokOps> AttentionBlock<B> {
    /// Attend `x` (`[seq, emb]`, positions starting at `position_offset`).
    ///
    /// With a cache, this step's keys and values are written for `layer`
    /// and attention runs over everything cached so far. The caller advances
    /// the cache once every layer has appended.
    ///
    /// # Errors
    /// Returns an error on shape mismatch or if the cache is full.
    pub fn forward(
        &self,
        x: &B::Tensor,
        rope: &RopeTables<B>,
        position_offset: usize,
        cache: Option<(&mut B::KvCache, usize)>,
    ) -> Result<B::Tensor> {
        let seq_len = x.rows();
        let hd = self.head_dim;

        let q = B::matmul(x, &self.query)?.reshape(&[seq_len, self.num_heads, hd])?;
        let k = B::matmul(x, &self.key)?.reshape(&[seq_len, self.num_kv_heads, hd])?;
        let v = B::matmul(x, &self.value)?.reshape(&[seq_len, self.num_kv_heads, hd])?;

        let q = B::apply_rope(&q, &rope.cos, &rope.sin, position_offset)?;
        let k = B::apply_rope(&k, &rope.cos, &rope.sin, position_offset)?;

        let scale = 1.0 / (hd as f32).sqrt();
        let attn = match cache {
            Some((cache, layer)) => {
                B::append_kv(cache, layer, &k, &v)?;
                let (k_all, v_all) = B::kv_history(cache, layer, position_offset + seq_len)?;
                B::causal_attention(&q, &k_all, &v_all, position_offset, scale, self.softcap)?
            }
            None => B::causal_attention(&q, &k, &v, position_offset, scale, self.softcap)?,
        };

        let mut attn = attn.reshape(&[seq_len, self.num_heads * hd])?;
        B::scale_inplace(&mut attn, self.output_multiplier)?;
        B::matmul(&attn, &self.linear)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grokrs::KvCacheOps;
    use grokrs_cpu::{CpuBackend, CpuTensor};

    fn ramp(shape: &[usize], step: f32) -> CpuTensor {
        let n: usize = shape.iter().product();
        let data: Vec<f32> = (0..n).map(|i| ((i % 7) as f32 - 3.0) * step).collect();
        CpuTensor::from_f32(shape, &data).unwrap()
    }

    fn block(output_multiplier: f32) -> AttentionBlock<CpuBackend> {
        // emb 4, 2 query heads sharing 1 kv head of dim 2
        AttentionBlock {
            query: ramp(&[4, 4], 0.1),
            key: ramp(&[4, 2], 0.2),
            value: ramp(&[4, 2], 0.3),
            linear: ramp(&[4, 4], 0.1),
            num_heads: 2,
            num_kv_heads: 1,
            head_dim: 2,
            output_multiplier,
            softcap: Some(30.0),
        }
    }

    #[test]
    fn test_output_multiplier_applied_once() {
        let rope = RopeTables::<CpuBackend>::new(8, 2, 10000.0).unwrap();
        let x = ramp(&[3, 4], 0.5);
        let one = block(1.0).forward(&x, &rope, 0, None).unwrap();
        let half = block(0.5).forward(&x, &rope, 0, None).unwrap();
        for (a, b) in one.as_slice().iter().zip(half.as_slice()) {
            assert!((a * 0.5 - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_cached_steps_match_full_pass() {
        let rope = RopeTables::<CpuBackend>::new(8, 2, 10000.0).unwrap();
        let attn = block(0.7);
        let x = ramp(&[3, 4], 0.5);
        let full = attn.forward(&x, &rope, 0, None).unwrap();

        let mut cache = CpuBackend::allocate_kv_cache(1, 8, 1, 2).unwrap();
        let prefix = x.narrow_rows(0, 2).unwrap();
        attn.forward(&prefix, &rope, 0, Some((&mut cache, 0))).unwrap();
        CpuBackend::advance(&mut cache, 2).unwrap();
        let last = x.narrow_rows(2, 1).unwrap();
        let step = attn.forward(&last, &rope, 2, Some((&mut cache, 0))).unwrap();

        for (a, b) in full.as_slice()[8..].iter().zip(step.as_slice()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }
}
