//! MoeOps implementation for CpuBackend.

use grokrs::backend::MoeOps;
use grokrs::tensor::Tensor;
use grokrs::{Error, Result};

use crate::kernels;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

fn check_rows(op: &str, rows: &[usize], available: usize) -> Result<()> {
    match rows.iter().find(|&&r| r >= available) {
        Some(r) => Err(Error::Other(format!(
            "{op}: row {r} out of range for {available} rows"
        ))),
        None => Ok(()),
    }
}

impl MoeOps for CpuBackend {
    fn gather_rows(input: &CpuTensor, rows: &[usize]) -> Result<CpuTensor> {
        let width = input.last_dim();
        check_rows("gather_rows", rows, input.rows())?;
        let data = input.as_slice();
        let mut out = Vec::with_capacity(rows.len() * width);
        for &r in rows {
            out.extend_from_slice(&data[r * width..(r + 1) * width]);
        }
        Ok(CpuTensor::from_parts(vec![rows.len(), width], out))
    }

    fn scatter_add_rows(
        out: &mut CpuTensor,
        rows: &[usize],
        src: &CpuTensor,
        weights: &[f32],
    ) -> Result<()> {
        let width = out.last_dim();
        if src.last_dim() != width || src.rows() != rows.len() || weights.len() != rows.len() {
            return Err(Error::shape(
                "scatter_add_rows source",
                &[rows.len(), width],
                src.shape(),
            ));
        }
        check_rows("scatter_add_rows", rows, out.rows())?;
        let src_data = src.as_slice();
        let out_data = out.as_mut_slice();
        for (i, (&r, &w)) in rows.iter().zip(weights).enumerate() {
            kernels::axpy(
                w,
                &src_data[i * width..(i + 1) * width],
                &mut out_data[r * width..(r + 1) * width],
            );
        }
        Ok(())
    }
}
