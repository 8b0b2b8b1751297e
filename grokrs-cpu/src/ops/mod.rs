//! CPU implementations of all backend op traits.

pub mod activation;
pub mod arith;
pub mod attention;
pub mod embed;
pub mod kv_cache;
pub mod matmul;
pub mod moe;
pub mod norm;
pub mod rope;
pub mod tensor_ops;

use grokrs::tensor::Tensor;
use grokrs::{Error, Result};

use crate::tensor::CpuTensor;

/// Element-wise ops need identical shapes.
pub(crate) fn check_same_shape(op: &str, a: &CpuTensor, b: &CpuTensor) -> Result<()> {
    if a.shape() == b.shape() {
        Ok(())
    } else {
        Err(Error::shape(op, a.shape(), b.shape()))
    }
}

/// Require a tensor of exactly `ndim` dimensions.
pub(crate) fn check_ndim(op: &str, t: &CpuTensor, ndim: usize) -> Result<()> {
    if t.ndim() == ndim {
        Ok(())
    } else {
        Err(Error::Other(format!(
            "{op}: expected {ndim}-d tensor, got shape {:?}",
            t.shape()
        )))
    }
}
