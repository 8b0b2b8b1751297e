//! Int8 weight quantization with per-output-channel scales.
//!
//! A weight of shape `[.., in, out]` is stored as int8 values plus an f32
//! scale tensor of shape `[.., 1, out]`: `w ≈ q * scale`, with each scale the
//! absolute maximum of its column divided by 127.

use crate::weights::host::HostTensor;
use crate::{Error, Result};

/// Quantized form of a weight: int8 values (held as f32) and column scales.
#[derive(Debug, Clone)]
pub struct QuantizedWeight {
    pub values: HostTensor,
    pub scales: HostTensor,
}

/// Shape of the scale tensor for a weight of `shape`.
///
/// # Errors
/// Returns `InvalidPartition` for tensors of rank below 2.
pub fn scale_shape(shape: &[usize]) -> Result<Vec<usize>> {
    if shape.len() < 2 {
        return Err(Error::InvalidPartition(format!(
            "int8 quantization needs rank >= 2, got {shape:?}"
        )));
    }
    let mut s = shape.to_vec();
    let n = s.len();
    s[n - 2] = 1;
    Ok(s)
}

/// Quantize `weight` to int8 per output column.
///
/// # Errors
/// Returns an error for tensors of rank below 2.
pub fn quantize_int8(weight: &HostTensor) -> Result<QuantizedWeight> {
    let s_shape = scale_shape(&weight.shape)?;
    let n = weight.shape.len();
    let (rows, cols) = (weight.shape[n - 2], weight.shape[n - 1]);
    let batches: usize = weight.shape[..n - 2].iter().product();

    let mut scales = vec![0.0_f32; batches * cols];
    let mut values = vec![0.0_f32; weight.data.len()];
    for b in 0..batches {
        let block = &weight.data[b * rows * cols..(b + 1) * rows * cols];
        let col_scales = &mut scales[b * cols..(b + 1) * cols];
        for r in 0..rows {
            for (c, s) in col_scales.iter_mut().enumerate() {
                *s = s.max(block[r * cols + c].abs());
            }
        }
        for s in col_scales.iter_mut() {
            *s = if *s > 0.0 { *s / 127.0 } else { 1.0 };
        }
        let out = &mut values[b * rows * cols..(b + 1) * rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[r * cols + c] = (block[r * cols + c] / col_scales[c]).round().clamp(-127.0, 127.0);
            }
        }
    }

    Ok(QuantizedWeight {
        values: HostTensor::new(weight.shape.clone(), values)?,
        scales: HostTensor::new(s_shape, scales)?,
    })
}

/// Undo [`quantize_int8`]: multiply every value by its column scale.
///
/// # Errors
/// Returns `ShapeMismatch` if `scales` is not shaped `[.., 1, out]` for `values`.
pub fn dequantize_int8(values: &HostTensor, scales: &HostTensor) -> Result<HostTensor> {
    let expected = scale_shape(&values.shape)?;
    if scales.shape != expected {
        return Err(Error::shape("quantization scales", &expected, &scales.shape));
    }
    let n = values.shape.len();
    let (rows, cols) = (values.shape[n - 2], values.shape[n - 1]);
    let mut out = values.data.clone();
    for (b, block) in out.chunks_mut((rows * cols).max(1)).enumerate() {
        let col_scales = &scales.data[b * cols..(b + 1) * cols];
        for row in block.chunks_mut(cols.max(1)) {
            for (v, s) in row.iter_mut().zip(col_scales) {
                *v *= s;
            }
        }
    }
    HostTensor::new(values.shape.clone(), out)
}
