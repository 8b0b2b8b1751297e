//! ArithOps implementation for CpuBackend.

use grokrs::backend::ArithOps;
use grokrs::tensor::Tensor;
use grokrs::Result;

use super::check_same_shape;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl ArithOps for CpuBackend {
    fn add(a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        check_same_shape("add", a, b)?;
        let out = a
            .as_slice()
            .iter()
            .zip(b.as_slice())
            .map(|(x, y)| x + y)
            .collect();
        Ok(CpuTensor::from_parts(a.shape().to_vec(), out))
    }

    fn add_inplace(a: &mut CpuTensor, b: &CpuTensor) -> Result<()> {
        check_same_shape("add_inplace", a, b)?;
        for (x, y) in a.as_mut_slice().iter_mut().zip(b.as_slice()) {
            *x += y;
        }
        Ok(())
    }

    fn mul(a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        check_same_shape("mul", a, b)?;
        let out = a
            .as_slice()
            .iter()
            .zip(b.as_slice())
            .map(|(x, y)| x * y)
            .collect();
        Ok(CpuTensor::from_parts(a.shape().to_vec(), out))
    }

    fn scale_inplace(a: &mut CpuTensor, scale: f32) -> Result<()> {
        for x in a.as_mut_slice() {
            *x *= scale;
        }
        Ok(())
    }
}
