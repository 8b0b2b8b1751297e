//! RopeOps implementation for CpuBackend (half-rotation layout).

use grokrs::backend::RopeOps;
use grokrs::tensor::Tensor;
use grokrs::{Error, Result};

use super::check_ndim;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl RopeOps for CpuBackend {
    fn apply_rope(
        input: &CpuTensor,
        cos_cache: &CpuTensor,
        sin_cache: &CpuTensor,
        position_offset: usize,
    ) -> Result<CpuTensor> {
        // input: (seq_len, num_heads, head_dim)
        check_ndim("apply_rope", input, 3)?;
        let shape = input.shape();
        let (seq_len, num_heads, head_dim) = (shape[0], shape[1], shape[2]);
        let half_dim = head_dim / 2;
        if cos_cache.last_dim() != half_dim || sin_cache.shape() != cos_cache.shape() {
            return Err(Error::shape("rope table", &[half_dim], cos_cache.shape()));
        }
        if position_offset + seq_len > cos_cache.rows() {
            return Err(Error::SequenceTooLong {
                len: position_offset + seq_len,
                max: cos_cache.rows(),
            });
        }

        let input_data = input.as_slice();
        let cos_data = cos_cache.as_slice();
        let sin_data = sin_cache.as_slice();

        let mut out = vec![0.0f32; input_data.len()];

        for s in 0..seq_len {
            let pos = position_offset + s;
            let cos_row = &cos_data[pos * half_dim..(pos + 1) * half_dim];
            let sin_row = &sin_data[pos * half_dim..(pos + 1) * half_dim];

            for h in 0..num_heads {
                let base = (s * num_heads + h) * head_dim;
                for d in 0..half_dim {
                    let x0 = input_data[base + d];
                    let x1 = input_data[base + half_dim + d];
                    out[base + d] = x0 * cos_row[d] - x1 * sin_row[d];
                    out[base + half_dim + d] = x1 * cos_row[d] + x0 * sin_row[d];
                }
            }
        }

        Ok(CpuTensor::from_parts(shape.to_vec(), out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grokrs::rope::precompute_rope_data;

    fn tables(max_seq: usize, head_dim: usize) -> (CpuTensor, CpuTensor) {
        let (cos, sin) = precompute_rope_data(max_seq, head_dim, 10_000.0).unwrap();
        (
            CpuTensor::new(&[max_seq, head_dim / 2], cos).unwrap(),
            CpuTensor::new(&[max_seq, head_dim / 2], sin).unwrap(),
        )
    }

    #[test]
    fn test_position_zero_is_identity() {
        let (cos, sin) = tables(4, 4);
        let x = CpuTensor::from_f32(&[1, 1, 4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = CpuBackend::apply_rope(&x, &cos, &sin, 0).unwrap();
        assert_eq!(out.as_slice(), x.as_slice());
    }

    #[test]
    fn test_offset_matches_row_position() {
        let (cos, sin) = tables(4, 4);
        let x = CpuTensor::from_f32(&[3, 1, 4], &[0.5; 12]).unwrap();
        let full = CpuBackend::apply_rope(&x, &cos, &sin, 0).unwrap();
        let one = CpuTensor::from_f32(&[1, 1, 4], &[0.5; 4]).unwrap();
        let at2 = CpuBackend::apply_rope(&one, &cos, &sin, 2).unwrap();
        assert_eq!(&full.as_slice()[8..], at2.as_slice());
    }

    #[test]
    fn test_rotation_preserves_norm() {
        let (cos, sin) = tables(8, 2);
        let x = CpuTensor::from_f32(&[1, 1, 2], &[3.0, 4.0]).unwrap();
        let out = CpuBackend::apply_rope(&x, &cos, &sin, 5).unwrap();
        let o = out.as_slice();
        assert!((o[0].hypot(o[1]) - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_past_table_end() {
        let (cos, sin) = tables(2, 2);
        let x = CpuTensor::zeros(&[2, 1, 2]);
        assert!(CpuBackend::apply_rope(&x, &cos, &sin, 1).is_err());
    }
}
