//! Host-side weight buffers.
//!
//! Everything the checkpoint loader hands to a backend is a dense f32
//! [`HostTensor`]; narrower storage dtypes and int8 quantization are undone
//! before tensors get here.

use crate::shard::{self, MeshCoord, ShardLayout};
use crate::tensor::check_numel;
use crate::{Error, Result};

/// Dense f32 tensor on the host, ready for upload to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    /// Logical shape, row-major.
    pub shape: Vec<usize>,
    /// Values, `shape.iter().product()` of them.
    pub data: Vec<f32>,
}

impl HostTensor {
    /// # Errors
    /// Returns `ShapeMismatch` if `data` does not hold exactly `numel(shape)` values.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        check_numel("host tensor", &shape, data.len())?;
        Ok(Self { shape, data })
    }

    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        let n = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; n],
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// The block of this (full) tensor owned by `coord`.
    ///
    /// # Errors
    /// Returns an error if this tensor's shape differs from the layout's
    /// global shape.
    pub fn shard(&self, layout: &ShardLayout, coord: MeshCoord) -> Result<Self> {
        if self.shape != layout.global_shape() {
            return Err(Error::shape(
                "sharded tensor",
                layout.global_shape(),
                &self.shape,
            ));
        }
        Ok(Self {
            shape: layout.local_shape().to_vec(),
            data: shard::shard(&self.data, layout, coord)?,
        })
    }

    /// Reassemble the full tensor from per-coordinate blocks.
    ///
    /// # Errors
    /// Returns an error if a block is missing or has the wrong shape.
    pub fn gather(layout: &ShardLayout, pieces: Vec<(MeshCoord, Self)>) -> Result<Self> {
        let mut flat = Vec::with_capacity(pieces.len());
        for (coord, piece) in pieces {
            if piece.shape != layout.local_shape() {
                return Err(Error::shape(
                    format!("shard at {coord}"),
                    layout.local_shape(),
                    &piece.shape,
                ));
            }
            flat.push((coord, piece.data));
        }
        Ok(Self {
            shape: layout.global_shape().to_vec(),
            data: shard::gather(layout, &flat)?,
        })
    }
}

/// Transpose a 2D host tensor: `[rows, cols]` -> `[cols, rows]`.
///
/// # Errors
/// Returns an error if the tensor is not 2D.
pub fn host_transpose_2d(tensor: &HostTensor) -> Result<HostTensor> {
    let &[rows, cols] = tensor.shape.as_slice() else {
        return Err(Error::Other(format!(
            "host_transpose_2d: expected 2D tensor, got {:?}",
            tensor.shape
        )));
    };
    let mut out = vec![0.0; tensor.data.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = tensor.data[r * cols + c];
        }
    }
    Ok(HostTensor {
        shape: vec![cols, rows],
        data: out,
    })
}
