//! GegluOps implementation for CpuBackend.

use grokrs::backend::GegluOps;
use grokrs::tensor::Tensor;
use grokrs::Result;

use super::check_same_shape;
use crate::kernels::gelu_tanh;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl GegluOps for CpuBackend {
    fn geglu(gate: &CpuTensor, up: &CpuTensor) -> Result<CpuTensor> {
        check_same_shape("geglu", gate, up)?;
        let out = gate
            .as_slice()
            .iter()
            .zip(up.as_slice())
            .map(|(&g, &u)| gelu_tanh(g) * u)
            .collect();
        Ok(CpuTensor::from_parts(gate.shape().to_vec(), out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geglu() {
        let gate = CpuTensor::from_f32(&[3], &[0.0, 1.0, -10.0]).unwrap();
        let up = CpuTensor::from_f32(&[3], &[5.0, 2.0, 3.0]).unwrap();
        let out = CpuBackend::geglu(&gate, &up).unwrap();
        let out = out.as_slice();
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 2.0 * 0.841_192).abs() < 1e-4);
        assert!(out[2].abs() < 1e-3);
    }
}
