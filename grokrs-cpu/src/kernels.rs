//! Scalar f32 kernels shared by the CPU op implementations.
//!
//! Plain loops the compiler can auto-vectorize; parallelism comes from the
//! callers splitting work over rows with Rayon.

#![allow(clippy::cast_precision_loss)]

/// Dot product of two f32 slices.
#[inline]
#[must_use]
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `y[i] += alpha * x[i]`.
#[inline]
pub fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    debug_assert_eq!(x.len(), y.len());
    for (y, x) in y.iter_mut().zip(x) {
        *y = alpha.mul_add(*x, *y);
    }
}

/// Sum of squares: `sum(a[i] * a[i])`.
#[inline]
#[must_use]
pub fn sum_of_squares(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum()
}

/// RMS norm: `out[i] = input[i] * weight[i] * rms_scale`
/// where `rms_scale = 1.0 / sqrt(mean_of_squares + eps)`.
#[inline]
pub fn vec_rmsnorm(input: &[f32], weight: &[f32], eps: f32, out: &mut [f32]) {
    let ss = sum_of_squares(input);
    let rms = 1.0 / (ss / input.len() as f32 + eps).sqrt();
    for ((o, x), w) in out.iter_mut().zip(input).zip(weight) {
        *o = x * rms * w;
    }
}

/// GELU activation (approximate): 0.5 * x * (1 + tanh(sqrt(2/π) * (x + 0.044715 * x³)))
#[inline]
#[must_use]
pub fn gelu_tanh(x: f32) -> f32 {
    let coeff = 0.797_884_6; // sqrt(2/π)
    let inner = coeff * x.mul_add(0.044_715 * x * x, x);
    0.5 * x * (1.0 + inner.tanh())
}

/// Numerically stable in-place softmax. Entries equal to `-inf` get zero
/// probability.
pub fn softmax_inplace(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return;
    }
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
}
