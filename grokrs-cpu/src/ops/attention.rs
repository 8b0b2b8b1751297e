//! AttentionOps implementation for CpuBackend.

use grokrs::backend::AttentionOps;
use grokrs::tensor::Tensor;
use grokrs::{Error, Result};
use rayon::prelude::*;

use super::check_ndim;
use crate::kernels;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Head geometry of one attention call.
#[derive(Clone, Copy)]
struct Dims {
    seq_len: usize,
    kv_len: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Dims {
    fn of(q: &CpuTensor, k: &CpuTensor, v: &CpuTensor) -> Result<Self> {
        check_ndim("attention q", q, 3)?;
        check_ndim("attention k", k, 3)?;
        if k.shape() != v.shape() {
            return Err(Error::shape("attention v", k.shape(), v.shape()));
        }
        let (seq_len, num_heads, head_dim) = (q.shape()[0], q.shape()[1], q.shape()[2]);
        let (kv_len, num_kv_heads) = (k.shape()[0], k.shape()[1]);
        if k.shape()[2] != head_dim {
            return Err(Error::shape("attention k head dim", &[head_dim], &[k.shape()[2]]));
        }
        if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
            return Err(Error::ConfigInvalid(format!(
                "{num_heads} query heads cannot share {num_kv_heads} kv heads"
            )));
        }
        Ok(Self {
            seq_len,
            kv_len,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }
}

/// Masked, scaled, softmaxed scores of one query head over every key position.
#[allow(clippy::too_many_arguments)]
fn head_probs(
    q_vec: &[f32],
    k: &[f32],
    dims: Dims,
    kv_h: usize,
    query_pos: usize,
    scale: f32,
    softcap: Option<f32>,
    probs: &mut [f32],
) {
    let hd = dims.head_dim;
    for (kv_pos, p) in probs.iter_mut().enumerate() {
        if kv_pos > query_pos {
            *p = f32::NEG_INFINITY;
            continue;
        }
        let k_offset = (kv_pos * dims.num_kv_heads + kv_h) * hd;
        let mut dot = kernels::dot_f32(q_vec, &k[k_offset..k_offset + hd]) * scale;
        if let Some(cap) = softcap {
            dot = cap * (dot / cap).tanh();
        }
        *p = dot;
    }
    kernels::softmax_inplace(probs);
}

/// Causal attention probabilities, `(seq, heads, kv_len)`.
///
/// Exposed so callers can inspect the mask; the forward path goes through
/// [`AttentionOps::causal_attention`].
///
/// # Errors
/// Returns an error on inconsistent shapes.
pub fn attention_probs(
    q: &CpuTensor,
    k: &CpuTensor,
    position_offset: usize,
    scale: f32,
    softcap: Option<f32>,
) -> Result<CpuTensor> {
    let dims = Dims::of(q, k, k)?;
    let gqa_ratio = dims.num_heads / dims.num_kv_heads;
    let (q_data, k_data) = (q.as_slice(), k.as_slice());
    let mut out = vec![0.0f32; dims.seq_len * dims.num_heads * dims.kv_len];
    if dims.kv_len > 0 {
        out.par_chunks_mut(dims.kv_len)
            .enumerate()
            .for_each(|(row, probs)| {
                let (s, h) = (row / dims.num_heads, row % dims.num_heads);
                let q_vec = &q_data[row * dims.head_dim..(row + 1) * dims.head_dim];
                head_probs(
                    q_vec,
                    k_data,
                    dims,
                    h / gqa_ratio,
                    position_offset + s,
                    scale,
                    softcap,
                    probs,
                );
            });
    }
    Ok(CpuTensor::from_parts(
        vec![dims.seq_len, dims.num_heads, dims.kv_len],
        out,
    ))
}

impl AttentionOps for CpuBackend {
    fn causal_attention(
        q: &CpuTensor,
        k: &CpuTensor,
        v: &CpuTensor,
        position_offset: usize,
        scale: f32,
        softcap: Option<f32>,
    ) -> Result<CpuTensor> {
        let dims = Dims::of(q, k, v)?;
        if position_offset + dims.seq_len > dims.kv_len {
            return Err(Error::Other(format!(
                "attention: queries reach position {} but only {} keys are present",
                position_offset + dims.seq_len,
                dims.kv_len
            )));
        }
        let gqa_ratio = dims.num_heads / dims.num_kv_heads;
        let hd = dims.head_dim;
        let (q_data, k_data, v_data) = (q.as_slice(), k.as_slice(), v.as_slice());

        // One output row per (position, head).
        let mut output = vec![0.0f32; dims.seq_len * dims.num_heads * hd];
        output
            .par_chunks_mut(hd)
            .enumerate()
            .for_each(|(row, out)| {
                let (s, h) = (row / dims.num_heads, row % dims.num_heads);
                let kv_h = h / gqa_ratio;
                let query_pos = position_offset + s;
                let mut probs = vec![0.0f32; dims.kv_len];
                head_probs(
                    &q_data[row * hd..(row + 1) * hd],
                    k_data,
                    dims,
                    kv_h,
                    query_pos,
                    scale,
                    softcap,
                    &mut probs,
                );
                for (kv_pos, &p) in probs.iter().enumerate().take(query_pos + 1) {
                    let v_offset = (kv_pos * dims.num_kv_heads + kv_h) * hd;
                    kernels::axpy(p, &v_data[v_offset..v_offset + hd], out);
                }
            });

        Ok(CpuTensor::from_parts(q.shape().to_vec(), output))
    }
}
