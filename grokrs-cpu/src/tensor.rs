//! CPU tensor implementation.

use std::sync::Arc;

use grokrs::tensor::{check_numel, Tensor};
use grokrs::Result;

/// A CPU-resident f32 tensor backed by shared storage.
///
/// Uses `Arc<Vec<f32>>` so clones and reshapes are cheap (shared backing);
/// the first mutation of a shared tensor copies it.
#[derive(Clone, Debug)]
pub struct CpuTensor {
    data: Arc<Vec<f32>>,
    offset: usize,
    shape: Vec<usize>,
}

impl CpuTensor {
    /// Create a tensor that takes ownership of `data`.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if `data` does not fill `shape`.
    pub fn new(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        check_numel("tensor data", shape, data.len())?;
        Ok(Self::from_parts(shape.to_vec(), data))
    }

    /// Create a tensor from an f32 slice.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if `data` does not fill `shape`.
    pub fn from_f32(shape: &[usize], data: &[f32]) -> Result<Self> {
        Self::new(shape, data.to_vec())
    }

    /// Create a zero-filled tensor.
    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        Self::from_parts(shape.to_vec(), vec![0.0; numel])
    }

    /// Kernels build their outputs with the right length by construction.
    pub(crate) fn from_parts(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self {
            data: Arc::new(data),
            offset: 0,
            shape,
        }
    }

    /// Get the data as an f32 slice.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data[self.offset..self.offset + self.numel()]
    }

    /// Get the data as a mutable f32 slice, copying first if shared.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        let start = self.offset;
        let end = start + self.numel();
        let data = Arc::make_mut(&mut self.data);
        &mut data[start..end]
    }

    /// Copy the data out.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        self.as_slice().to_vec()
    }

    /// View rows `start..start + len` of the leading dimension without copying.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if the range runs past the tensor.
    pub fn narrow_rows(&self, start: usize, len: usize) -> Result<Self> {
        let rows = self.shape.first().copied().unwrap_or(1);
        if start + len > rows {
            return Err(grokrs::Error::shape(
                "row range",
                &[start + len],
                &[rows],
            ));
        }
        let row_size: usize = self.shape.iter().skip(1).product();
        let mut shape = self.shape.clone();
        if let Some(first) = shape.first_mut() {
            *first = len;
        }
        Ok(Self {
            data: Arc::clone(&self.data),
            offset: self.offset + start * row_size,
            shape,
        })
    }
}

impl Tensor for CpuTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn reshape(&self, shape: &[usize]) -> Result<Self> {
        check_numel("reshape", shape, self.numel())?;
        Ok(Self {
            data: Arc::clone(&self.data),
            offset: self.offset,
            shape: shape.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_f32() {
        let t = CpuTensor::from_f32(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.numel(), 6);
        assert_eq!(t.as_slice(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(CpuTensor::from_f32(&[2, 2], &[1.0]).is_err());
    }

    #[test]
    fn test_reshape() {
        let t = CpuTensor::from_f32(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let r = t.reshape(&[3, 2]).unwrap();
        assert_eq!(r.shape(), &[3, 2]);
        assert_eq!(r.as_slice(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(t.reshape(&[4, 2]).is_err());
    }

    #[test]
    fn test_narrow_rows() {
        let t = CpuTensor::from_f32(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let s = t.narrow_rows(1, 2).unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.as_slice(), &[3.0, 4.0, 5.0, 6.0]);
        assert!(t.narrow_rows(2, 2).is_err());
    }

    #[test]
    fn test_zeros() {
        let t = CpuTensor::zeros(&[2, 2]);
        assert_eq!(t.as_slice(), &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_clone_shares_until_written() {
        let t = CpuTensor::from_f32(&[3], &[1.0, 2.0, 3.0]).unwrap();
        let mut c = t.clone();
        assert!(std::ptr::eq(t.data.as_ref(), c.data.as_ref()));
        c.as_mut_slice()[0] = 9.0;
        assert_eq!(t.as_slice()[0], 1.0);
        assert_eq!(c.as_slice()[0], 9.0);
    }
}
