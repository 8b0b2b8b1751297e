//! Tensor trait definition

use crate::{Error, Result};

/// Interface shared by every backend tensor.
///
/// Backend tensors always hold f32 activations; storage dtypes are resolved
/// by the checkpoint loader before anything reaches a backend.
pub trait Tensor: Sized {
    /// Returns the shape of the tensor as a slice of dimensions
    fn shape(&self) -> &[usize];

    /// Create a view with a different shape (same data, same number of elements).
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the new shape has a different number of elements.
    fn reshape(&self, shape: &[usize]) -> Result<Self>;

    /// Returns the total number of elements in the tensor
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Returns the number of dimensions (rank) of the tensor
    fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Length of the innermost dimension (1 for scalars)
    fn last_dim(&self) -> usize {
        self.shape().last().copied().unwrap_or(1)
    }

    /// Number of rows when viewed as a `(rows, last_dim)` matrix
    fn rows(&self) -> usize {
        let last = self.last_dim();
        if last == 0 {
            0
        } else {
            self.numel() / last
        }
    }

    /// Returns the stride for each dimension
    fn strides(&self) -> Vec<usize> {
        let shape = self.shape();
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }
}

/// Check that `shape` holds exactly `numel` elements.
///
/// # Errors
/// Returns `ShapeMismatch` naming `what` when the counts differ.
pub fn check_numel(what: &str, shape: &[usize], numel: usize) -> Result<()> {
    let wanted: usize = shape.iter().product();
    if wanted == numel {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            name: what.to_string(),
            expected: shape.to_vec(),
            got: vec![numel],
        })
    }
}
