//! Top-k expert routing.
//!
//! Routing is a pure function of one token's router scores, so every rank of
//! a model-axis group computes the same decision without communicating.

use std::cmp::Ordering;

use crate::{Error, Result};

/// One selected expert and its mixing weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpertChoice {
    pub expert: usize,
    pub weight: f32,
}

/// The experts chosen for one token, best score first.
///
/// Weights are non-negative and sum to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterDecision {
    pub choices: Vec<ExpertChoice>,
}

impl RouterDecision {
    /// Whether `expert` was selected.
    pub fn selects(&self, expert: usize) -> bool {
        self.choices.iter().any(|c| c.expert == expert)
    }

    /// The weight given to `expert`, zero when not selected.
    pub fn weight_of(&self, expert: usize) -> f32 {
        self.choices
            .iter()
            .find(|c| c.expert == expert)
            .map_or(0.0, |c| c.weight)
    }
}

/// Pick the `k` highest-scoring experts and softmax over their scores.
///
/// Ties go to the lower expert index.
///
/// # Errors
/// Returns an error if `k` is zero or larger than the number of experts, or
/// if any score is NaN.
pub fn route_token(scores: &[f32], k: usize) -> Result<RouterDecision> {
    if k == 0 || k > scores.len() {
        return Err(Error::ConfigInvalid(format!(
            "cannot select {k} of {} experts",
            scores.len()
        )));
    }
    if scores.iter().any(|s| s.is_nan()) {
        return Err(Error::Other("router produced NaN scores".into()));
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    // NaN is rejected above, so `partial_cmp` only sees ordered values and
    // treats -0.0 and 0.0 as equal.
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });
    order.truncate(k);

    let max = scores[order[0]];
    let exps: Vec<f32> = order.iter().map(|&e| (scores[e] - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    let choices = order
        .into_iter()
        .zip(exps)
        .map(|(expert, e)| ExpertChoice {
            expert,
            weight: e / sum,
        })
        .collect();
    Ok(RouterDecision { choices })
}

/// Group token rows by expert: entry `e` lists `(row, weight)` pairs routed
/// to expert `e`, in row order.
pub fn group_by_expert(decisions: &[RouterDecision], num_experts: usize) -> Vec<Vec<(usize, f32)>> {
    let mut groups = vec![Vec::new(); num_experts];
    for (row, decision) in decisions.iter().enumerate() {
        for choice in &decision.choices {
            if let Some(group) = groups.get_mut(choice.expert) {
                group.push((row, choice.weight));
            }
        }
    }
    groups
}
