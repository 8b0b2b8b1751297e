//! Data types for stored tensor elements

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Element types a checkpoint tensor may be stored in.
///
/// Compute happens in f32; the narrower types only exist on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// Brain floating point (16-bit)
    BF16,
    /// Signed 8-bit integer, used for quantized weights
    I8,
}

impl DType {
    /// Size of the dtype in bytes
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::I8 => 1,
        }
    }

    /// Convert from a safetensors dtype
    ///
    /// # Errors
    /// Returns `UnsupportedDtype` for anything outside the supported set.
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Result<Self> {
        match dtype {
            safetensors::Dtype::F32 => Ok(Self::F32),
            safetensors::Dtype::F16 => Ok(Self::F16),
            safetensors::Dtype::BF16 => Ok(Self::BF16),
            safetensors::Dtype::I8 => Ok(Self::I8),
            other => Err(Error::UnsupportedDtype(format!("{other:?}"))),
        }
    }

    /// The matching safetensors dtype
    #[must_use]
    pub const fn to_safetensors(self) -> safetensors::Dtype {
        match self {
            Self::F32 => safetensors::Dtype::F32,
            Self::F16 => safetensors::Dtype::F16,
            Self::BF16 => safetensors::Dtype::BF16,
            Self::I8 => safetensors::Dtype::I8,
        }
    }

    /// Decode little-endian raw bytes of this dtype into f32 values.
    ///
    /// # Errors
    /// Returns an error if the byte count is not a multiple of the element size.
    pub fn decode_f32(self, bytes: &[u8]) -> Result<Vec<f32>> {
        if bytes.len() % self.size_in_bytes() != 0 {
            return Err(Error::SafeTensors(format!(
                "{} bytes is not a whole number of {self} elements",
                bytes.len()
            )));
        }
        let values = match self {
            Self::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Self::F16 => bytes
                .chunks_exact(2)
                .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            Self::BF16 => bytes
                .chunks_exact(2)
                .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            Self::I8 => bytes.iter().map(|&b| f32::from(b as i8)).collect(),
        };
        Ok(values)
    }

    /// Encode f32 values as little-endian bytes of this dtype.
    ///
    /// `I8` values are rounded and saturated; quantization with scales lives in
    /// [`crate::weights::quantize`].
    #[must_use]
    pub fn encode_f32(self, values: &[f32]) -> Vec<u8> {
        match self {
            Self::F32 => bytemuck::cast_slice::<f32, u8>(values).to_vec(),
            Self::F16 => {
                let halves: Vec<half::f16> = values.iter().map(|&v| half::f16::from_f32(v)).collect();
                bytemuck::cast_slice::<half::f16, u8>(&halves).to_vec()
            }
            Self::BF16 => {
                let halves: Vec<half::bf16> =
                    values.iter().map(|&v| half::bf16::from_f32(v)).collect();
                bytemuck::cast_slice::<half::bf16, u8>(&halves).to_vec()
            }
            #[allow(clippy::cast_possible_truncation)]
            Self::I8 => values
                .iter()
                .map(|&v| v.round().clamp(-127.0, 127.0) as i8 as u8)
                .collect(),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
            Self::I8 => write!(f, "i8"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size_in_bytes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::I8.size_in_bytes(), 1);
    }

    #[test]
    fn test_dtype_from_safetensors() {
        assert_eq!(
            DType::from_safetensors(safetensors::Dtype::BF16).unwrap(),
            DType::BF16
        );
        assert!(DType::from_safetensors(safetensors::Dtype::I32).is_err());
    }

    #[test]
    fn test_dtype_display() {
        assert_eq!(format!("{}", DType::F32), "f32");
        assert_eq!(format!("{}", DType::BF16), "bf16");
        assert_eq!(format!("{}", DType::I8), "i8");
    }

    #[test]
    fn test_dtype_serde_lowercase() {
        assert_eq!(serde_json::to_string(&DType::BF16).unwrap(), "\"bf16\"");
        let d: DType = serde_json::from_str("\"i8\"").unwrap();
        assert_eq!(d, DType::I8);
    }

    #[test]
    fn test_half_round_trip_is_exact_for_small_integers() {
        let values = [0.0_f32, 1.0, -2.0, 3.5];
        for dtype in [DType::F32, DType::F16, DType::BF16] {
            let bytes = dtype.encode_f32(&values);
            assert_eq!(bytes.len(), values.len() * dtype.size_in_bytes());
            assert_eq!(dtype.decode_f32(&bytes).unwrap(), values);
        }
    }

    #[test]
    fn test_i8_saturates() {
        let bytes = DType::I8.encode_f32(&[300.0, -300.0, 4.4]);
        assert_eq!(DType::I8.decode_f32(&bytes).unwrap(), vec![127.0, -127.0, 4.0]);
    }

    #[test]
    fn test_decode_rejects_ragged_bytes() {
        assert!(DType::F32.decode_f32(&[0, 0, 0]).is_err());
    }
}
