//! RoPE (Rotary Positional Embeddings) precomputation.
//!
//! Pure host-side computation of cos/sin tables. The results are
//! `Vec<f32>` arrays that can be uploaded to any backend via
//! `TensorFactory::from_f32_slice`.

#![allow(clippy::cast_precision_loss)]

use crate::{Error, Result};

/// Precompute RoPE cos/sin tables.
///
/// Returns `(cos_data, sin_data)` each of length `max_seq_len * (head_dim / 2)`,
/// stored in row-major order `[max_seq_len, head_dim / 2]`. Pair `i` of a head
/// rotates elements `i` and `i + head_dim / 2` (rotate-half layout).
///
/// # Errors
/// Returns `ConfigInvalid` if `head_dim` is zero or odd.
pub fn precompute_rope_data(
    max_seq_len: usize,
    head_dim: usize,
    base: f32,
) -> Result<(Vec<f32>, Vec<f32>)> {
    if head_dim == 0 || head_dim % 2 != 0 {
        return Err(Error::ConfigInvalid(format!(
            "rotary head dim must be even and non-zero, got {head_dim}"
        )));
    }
    let half_dim = head_dim / 2;
    let mut cos_data = vec![0.0_f32; max_seq_len * half_dim];
    let mut sin_data = vec![0.0_f32; max_seq_len * half_dim];

    for i in 0..half_dim {
        let freq = 1.0 / base.powf(2.0 * i as f32 / head_dim as f32);
        for pos in 0..max_seq_len {
            let angle = pos as f32 * freq;
            cos_data[pos * half_dim + i] = angle.cos();
            sin_data[pos * half_dim + i] = angle.sin();
        }
    }

    Ok((cos_data, sin_data))
}
