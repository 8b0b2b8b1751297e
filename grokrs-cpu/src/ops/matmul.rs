//! MatmulOps implementation for CpuBackend.
//!
//! All matmul is f32 row-major, using standard `A (M,K) × B (K,N) → C (M,N)`.
//! Weight matrices are stored as `(in_features, out_features)`, exactly as
//! they sit in the checkpoint.
//!
//! B is transposed to `Bᵀ(N,K)` so that `C[m,n] = dot(A[m,:], Bᵀ[n,:])`
//! becomes a contiguous dot product. Output rows are parallelized with Rayon.

use grokrs::backend::MatmulOps;
use grokrs::tensor::Tensor;
use grokrs::{Error, Result};
use rayon::prelude::*;

use crate::kernels;
use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Transpose `B (K,N)` → `Bᵀ (N,K)` in row-major order.
#[allow(clippy::many_single_char_names)]
fn transpose(b: &[f32], k: usize, n: usize) -> Vec<f32> {
    let mut bt = vec![0.0f32; n * k];
    for row in 0..k {
        for col in 0..n {
            bt[col * k + row] = b[row * n + col];
        }
    }
    bt
}

/// Compute one row of C: `C[m,:] = A[m,:] × Bᵀ`.
#[allow(clippy::many_single_char_names)]
fn gemm_row(a_row: &[f32], bt: &[f32], c_row: &mut [f32], k: usize) {
    for (col, c) in c_row.iter_mut().enumerate() {
        *c = kernels::dot_f32(a_row, &bt[col * k..(col + 1) * k]);
    }
}

/// Standard gemm: `A (M,K) × B (K,N) → C (M,N)`.
#[allow(clippy::many_single_char_names)]
fn gemm(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let bt = transpose(b, k, n);
    let mut c = vec![0.0f32; m * n];
    if n == 0 {
        return c;
    }

    if m == 1 {
        // GEMV (decode phase): single row, skip thread-pool overhead
        gemm_row(&a[..k], &bt, &mut c[..n], k);
    } else {
        c.par_chunks_mut(n).enumerate().for_each(|(row, c_row)| {
            gemm_row(&a[row * k..(row + 1) * k], &bt, c_row, k);
        });
    }

    c
}

impl MatmulOps for CpuBackend {
    fn matmul(input: &CpuTensor, weight: &CpuTensor) -> Result<CpuTensor> {
        // input (..., K) × weight (K, N) → (..., N)
        let w_shape = weight.shape();
        if w_shape.len() != 2 {
            return Err(Error::Other(format!(
                "matmul: weight must be 2D, got {w_shape:?}"
            )));
        }
        let (k, n) = (w_shape[0], w_shape[1]);

        let i_shape = input.shape();
        if input.last_dim() != k {
            return Err(Error::shape("matmul input", &[k], &[input.last_dim()]));
        }
        let m = input.rows();

        let output = gemm(input.as_slice(), weight.as_slice(), m, k, n);

        let mut out_shape = i_shape[..i_shape.len().saturating_sub(1)].to_vec();
        out_shape.push(n);
        Ok(CpuTensor::from_parts(out_shape, output))
    }
}
