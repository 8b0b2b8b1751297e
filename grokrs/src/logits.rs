//! Opaque logits trait for backend-agnostic sampling.
//!
//! The runner decides *what* to draw (greedy vs sampled); the backend only
//! has to hand over each row's values.

use crate::sampling::{self, SamplingParams};
use crate::Result;

/// Opaque logits from a forward pass.
///
/// Values already carry the model's output scale; samplers must not apply
/// it again.
pub trait Logits: Send {
    /// Vocabulary size (number of logit values per row).
    fn vocab_size(&self) -> usize;

    /// Number of rows.
    fn batch_size(&self) -> usize;

    /// Copy one row to the host.
    ///
    /// # Errors
    /// Returns an error if `batch_index` is out of range.
    fn row(&self, batch_index: usize) -> Result<Vec<f32>>;

    /// Greedy: the token with the highest logit, lowest id on ties.
    ///
    /// # Errors
    /// Returns an error if the row cannot be read.
    fn argmax(&self, batch_index: usize) -> Result<u32> {
        sampling::argmax(&self.row(batch_index)?)
    }

    /// Draw a token from one row.
    ///
    /// # Errors
    /// Returns an error if the row cannot be read or the params are invalid.
    fn sample(
        &self,
        batch_index: usize,
        params: &SamplingParams,
        rng: &mut dyn rand::RngCore,
    ) -> Result<u32> {
        sampling::sample(&self.row(batch_index)?, params, rng)
    }
}
