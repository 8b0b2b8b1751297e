//! EmbedOps implementation for CpuBackend.

use grokrs::backend::EmbedOps;
use grokrs::tensor::Tensor;
use grokrs::{Error, Result};

use super::check_ndim;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl EmbedOps for CpuBackend {
    fn embedding_gather(table: &CpuTensor, indices: &[u32]) -> Result<CpuTensor> {
        check_ndim("embedding table", table, 2)?;
        let table_data = table.as_slice();
        let (vocab_size, hidden_size) = (table.shape()[0], table.shape()[1]);

        let mut out = Vec::with_capacity(indices.len() * hidden_size);
        for &idx in indices {
            if idx as usize >= vocab_size {
                return Err(Error::OutOfVocabulary {
                    token: idx,
                    vocab_size,
                });
            }
            let start = idx as usize * hidden_size;
            out.extend_from_slice(&table_data[start..start + hidden_size]);
        }
        Ok(CpuTensor::from_parts(vec![indices.len(), hidden_size], out))
    }
}
