//! Sparse mixture-of-experts feed-forward over one model-axis shard.
//!
//! The router is replicated, so every rank routes identically. Each expert's
//! hidden width is split over the model axis: `linear` / `linear_v` are
//! column-parallel and `linear_1` is row-parallel, so the block output is a
//! partial sum the caller reduces.

use grokrs::moe::group_by_expert;
use grokrs::{route_token, Backend, Result, RouterDecision, Tensor};

use crate::GrokOps;

/// One expert's projections on this rank.
pub struct ExpertWeights<B: Backend> {
    /// `[emb, local_ffn]`
    pub linear: B::Tensor,
    /// `[emb, local_ffn]`
    pub linear_v: B::Tensor,
    /// `[local_ffn, emb]`
    pub linear_1: B::Tensor,
}

pub struct MoeBlock<B: Backend> {
    /// `[emb, num_experts]`
    pub router: B::Tensor,
    pub experts: Vec<ExpertWeights<B>>,
    pub num_selected: usize,
}

impl<B: GrokOps> MoeBlock<B> {
    /// Routing decision for every row of `x`.
    ///
    /// # Errors
    /// Returns an error if the router matmul fails or produces NaN.
    pub fn route(&self, x: &B::Tensor) -> Result<Vec<RouterDecision>> {
        let scores = B::to_f32_vec(&B::matmul(x, &self.router)?)?;
        let num_experts = self.experts.len();
        scores
            .chunks(num_experts.max(1))
            .map(|row| route_token(row, self.num_selected))
            .collect()
    }

    /// Mix the selected experts' outputs for every row of `x` (`[seq, emb]`).
    ///
    /// Experts no token selected are never evaluated.
    ///
    /// # Errors
    /// Returns an error on shape mismatch.
    pub fn forward(&self, x: &B::Tensor) -> Result<B::Tensor> {
        let decisions = self.route(x)?;
        let mut out = B::zeros(&[x.rows(), x.last_dim()])?;
        for (expert, assigned) in group_by_expert(&decisions, self.experts.len())
            .into_iter()
            .enumerate()
        {
            if assigned.is_empty() {
                continue;
            }
            let (rows, weights): (Vec<usize>, Vec<f32>) = assigned.into_iter().unzip();
            tracing::trace!(expert, tokens = rows.len(), "expert dispatch");
            let w = &self.experts[expert];
            let xs = B::gather_rows(x, &rows)?;
            let gate = B::matmul(&xs, &w.linear)?;
            let up = B::matmul(&xs, &w.linear_v)?;
            let hidden = B::geglu(&gate, &up)?;
            let y = B::matmul(&hidden, &w.linear_1)?;
            B::scatter_add_rows(&mut out, &rows, &y, &weights)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grokrs::{GegluOps, MatmulOps};
    use grokrs_cpu::{CpuBackend, CpuTensor};

    fn filled(shape: &[usize], v: f32) -> CpuTensor {
        let n: usize = shape.iter().product();
        CpuTensor::from_f32(shape, &vec![v; n]).unwrap()
    }

    fn expert(scale: f32) -> ExpertWeights<CpuBackend> {
        ExpertWeights {
            linear: filled(&[2, 3], 0.5 * scale),
            linear_v: filled(&[2, 3], 0.25),
            linear_1: filled(&[3, 2], 0.1),
        }
    }

    fn block(unselected_scale: f32) -> MoeBlock<CpuBackend> {
        // Router favours expert 0 then expert 2; expert 1 never wins.
        #[rustfmt::skip]
        let router = CpuTensor::from_f32(&[2, 3], &[
            2.0, -5.0, 1.0,
            2.0, -5.0, 1.0,
        ]).unwrap();
        MoeBlock {
            router,
            experts: vec![expert(1.0), expert(unselected_scale), expert(2.0)],
            num_selected: 2,
        }
    }

    #[test]
    fn test_route_weights_sum_to_one() {
        let x = CpuTensor::from_f32(&[2, 2], &[1.0, 0.5, -0.2, 0.3]).unwrap();
        for d in block(1.0).route(&x).unwrap() {
            assert_eq!(d.choices.len(), 2);
            let total: f32 = d.choices.iter().map(|c| c.weight).sum();
            assert!((total - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_unselected_expert_has_no_influence() {
        let x = CpuTensor::from_f32(&[2, 2], &[1.0, 0.5, 0.7, 0.3]).unwrap();
        let a = block(1.0).forward(&x).unwrap();
        let b = block(1000.0).forward(&x).unwrap();
        assert!(!block(1.0).route(&x).unwrap().iter().any(|d| d.selects(1)));
        assert_eq!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn test_output_is_weighted_mix() {
        let x = CpuTensor::from_f32(&[1, 2], &[1.0, 1.0]).unwrap();
        let moe = block(1.0);
        let decision = &moe.route(&x).unwrap()[0];
        let out = moe.forward(&x).unwrap();

        let single = |e: &ExpertWeights<CpuBackend>| {
            let gate = CpuBackend::matmul(&x, &e.linear).unwrap();
            let up = CpuBackend::matmul(&x, &e.linear_v).unwrap();
            let h = CpuBackend::geglu(&gate, &up).unwrap();
            CpuBackend::matmul(&h, &e.linear_1).unwrap().to_vec()
        };
        let e0 = single(&moe.experts[0]);
        let e2 = single(&moe.experts[2]);
        for i in 0..2 {
            let expected = decision.weight_of(0) * e0[i] + decision.weight_of(2) * e2[i];
            assert!((out.as_slice()[i] - expected).abs() < 1e-6);
        }
    }
}
