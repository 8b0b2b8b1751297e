//! TensorOps and TensorFactory implementations.

use grokrs::backend::{TensorFactory, TensorOps};
use grokrs::tensor::Tensor;
use grokrs::{Error, Result};

use crate::logits::CpuLogits;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl TensorFactory for CpuBackend {
    fn from_f32_slice(shape: &[usize], data: &[f32]) -> Result<CpuTensor> {
        CpuTensor::from_f32(shape, data)
    }

    fn zeros(shape: &[usize]) -> Result<CpuTensor> {
        Ok(CpuTensor::zeros(shape))
    }

    fn to_f32_vec(tensor: &CpuTensor) -> Result<Vec<f32>> {
        Ok(tensor.to_vec())
    }

    fn into_logits(tensor: CpuTensor) -> Result<CpuLogits> {
        CpuLogits::from_tensor(&tensor)
    }
}

impl TensorOps for CpuBackend {
    fn slice_last_dim(input: &CpuTensor, start: usize, len: usize) -> Result<CpuTensor> {
        let width = input.last_dim();
        if start + len > width {
            return Err(Error::shape("slice_last_dim", &[start + len], &[width]));
        }
        let data = input.as_slice();
        let mut out = Vec::with_capacity(input.rows() * len);
        for row in data.chunks(width) {
            out.extend_from_slice(&row[start..start + len]);
        }
        let mut shape = input.shape().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = len;
        }
        Ok(CpuTensor::from_parts(shape, out))
    }

    fn last_row(input: &CpuTensor) -> Result<CpuTensor> {
        let rows = input.rows();
        if rows == 0 {
            return Err(Error::Other("last_row of an empty tensor".into()));
        }
        input
            .reshape(&[rows, input.last_dim()])?
            .narrow_rows(rows - 1, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_last_dim() {
        let x = CpuTensor::from_f32(&[2, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        let s = CpuBackend::slice_last_dim(&x, 1, 2).unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.as_slice(), &[1.0, 2.0, 4.0, 5.0]);
        assert!(CpuBackend::slice_last_dim(&x, 2, 2).is_err());
    }

    #[test]
    fn test_last_row() {
        let x = CpuTensor::from_f32(&[3, 2], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        let r = CpuBackend::last_row(&x).unwrap();
        assert_eq!(r.shape(), &[1, 2]);
        assert_eq!(r.as_slice(), &[4.0, 5.0]);
    }
}
