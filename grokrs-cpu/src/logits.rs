//! CPU logits implementation.

use grokrs::logits::Logits;
use grokrs::tensor::Tensor;
use grokrs::{Error, Result};

use crate::tensor::CpuTensor;

/// CPU logits: f32 data already on host, sampling is scalar.
#[derive(Debug, Clone)]
pub struct CpuLogits {
    data: Vec<f32>,
    vocab_size: usize,
    batch_size: usize,
}

impl CpuLogits {
    /// Wrap a `(rows, vocab)` tensor; a 1-D tensor is a single row.
    ///
    /// # Errors
    /// Returns an error for a scalar tensor.
    pub fn from_tensor(tensor: &CpuTensor) -> Result<Self> {
        if tensor.ndim() == 0 {
            return Err(Error::Other("logits need at least one dimension".into()));
        }
        Ok(Self {
            data: tensor.to_vec(),
            vocab_size: tensor.last_dim(),
            batch_size: tensor.rows(),
        })
    }

    /// All rows, flattened.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

impl Logits for CpuLogits {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn row(&self, batch_index: usize) -> Result<Vec<f32>> {
        if batch_index >= self.batch_size {
            return Err(Error::Other(format!(
                "logits row {batch_index} out of range for {} rows",
                self.batch_size
            )));
        }
        let start = batch_index * self.vocab_size;
        Ok(self.data[start..start + self.vocab_size].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grokrs::SamplingParams;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_rows_and_argmax() {
        let t = CpuTensor::from_f32(&[2, 3], &[0.1, 0.9, 0.0, 2.0, 2.0, 1.0]).unwrap();
        let logits = CpuLogits::from_tensor(&t).unwrap();
        assert_eq!(logits.batch_size(), 2);
        assert_eq!(logits.vocab_size(), 3);
        assert_eq!(logits.argmax(0).unwrap(), 1);
        // Ties go to the lower id.
        assert_eq!(logits.argmax(1).unwrap(), 0);
        assert!(logits.row(2).is_err());
    }

    #[test]
    fn test_sample_is_seeded() {
        let t = CpuTensor::from_f32(&[1, 4], &[1.0, 1.1, 0.9, 1.0]).unwrap();
        let logits = CpuLogits::from_tensor(&t).unwrap();
        let params = SamplingParams {
            temperature: 1.0,
            top_p: 1.0,
            top_k: None,
            seed: 7,
        };
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let xs: Vec<u32> = (0..8).map(|_| logits.sample(0, &params, &mut a).unwrap()).collect();
        let ys: Vec<u32> = (0..8).map(|_| logits.sample(0, &params, &mut b).unwrap()).collect();
        assert_eq!(xs, ys);
    }
}
