//! NormOps implementation for CpuBackend.

use grokrs::backend::NormOps;
use grokrs::tensor::Tensor;
use grokrs::{Error, Result};
use rayon::prelude::*;

use crate::kernels;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl NormOps for CpuBackend {
    fn rms_norm(input: &CpuTensor, weight: &CpuTensor, eps: f32) -> Result<CpuTensor> {
        let hidden_size = weight.numel();
        if input.last_dim() != hidden_size {
            return Err(Error::shape("rms_norm weight", &[input.last_dim()], weight.shape()));
        }
        let input_data = input.as_slice();
        let weight_data = weight.as_slice();

        let mut out = vec![0.0f32; input_data.len()];
        out.par_chunks_mut(hidden_size)
            .zip(input_data.par_chunks(hidden_size))
            .for_each(|(row_out, row_in)| {
                kernels::vec_rmsnorm(row_in, weight_data, eps, row_out);
            });
        Ok(CpuTensor::from_parts(input.shape().to_vec(), out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_norm_rows_independent() {
        let x = CpuTensor::from_f32(&[2, 2], &[3.0, 4.0, 1.0, 1.0]).unwrap();
        let w = CpuTensor::from_f32(&[2], &[1.0, 2.0]).unwrap();
        let out = CpuBackend::rms_norm(&x, &w, 0.0).unwrap();
        let out = out.as_slice();
        let rms = 12.5f32.sqrt();
        assert!((out[0] - 3.0 / rms).abs() < 1e-6);
        assert!((out[1] - 8.0 / rms).abs() < 1e-6);
        assert!((out[2] - 1.0).abs() < 1e-6);
        assert!((out[3] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_rms_norm_weight_mismatch() {
        let x = CpuTensor::zeros(&[2, 3]);
        let w = CpuTensor::zeros(&[2]);
        assert!(CpuBackend::rms_norm(&x, &w, 1e-5).is_err());
    }
}
