//! Sampling parameters and the token sampler.
//!
//! [`sample`] turns one row of logits into a token id. Temperature 0 is
//! deterministic argmax with ties going to the lowest id; otherwise the
//! logits are temperature-scaled, truncated to the top-k, turned into
//! probabilities, truncated to the top-p nucleus, renormalised, and one
//! uniform draw is taken from the caller's random source.

use std::cmp::Ordering;

use rand::Rng;

use crate::{Error, Result};

/// Parameters for temperature / top-k / top-p sampling
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Temperature for logit scaling (higher = more random). 0 means greedy.
    pub temperature: f32,
    /// Nucleus probability threshold in (0, 1]. 1.0 disables it.
    pub top_p: f32,
    /// Keep only the `k` most likely tokens. `None` disables it.
    pub top_k: Option<usize>,
    /// Seed for the PRNG. Same seed + same input → same output.
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: None,
            seed: 42,
        }
    }
}

impl SamplingParams {
    /// Deterministic argmax decoding.
    #[must_use]
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            top_k: None,
            seed: 0,
        }
    }

    /// # Errors
    /// Returns `InvalidRequest` for a negative or non-finite temperature, a
    /// `top_p` outside (0, 1], or `top_k == Some(0)`.
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::InvalidRequest(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::InvalidRequest(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.top_k == Some(0) {
            return Err(Error::InvalidRequest("top_k must be at least 1".into()));
        }
        Ok(())
    }
}

/// Options for one generation request.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Maximum number of new tokens to generate.
    pub max_new_tokens: usize,
    /// Optional EOS token ID to stop generation early.
    pub eos_token_id: Option<u32>,
    /// Sampling parameters. `None` means greedy (argmax) decoding.
    pub sampling: Option<SamplingParams>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            eos_token_id: None,
            sampling: None,
        }
    }
}

impl GenerateOptions {
    /// Sampling parameters in effect, greedy when none were given.
    #[must_use]
    pub fn sampling_params(&self) -> SamplingParams {
        self.sampling.clone().unwrap_or_else(SamplingParams::greedy)
    }
}

fn finite_or_neg_inf(v: f32) -> f32 {
    if v.is_nan() {
        f32::NEG_INFINITY
    } else {
        v
    }
}

/// Index of the largest logit, lowest index on ties. NaN never wins.
///
/// # Errors
/// Returns `InvalidRequest` for an empty slice.
pub fn argmax(logits: &[f32]) -> Result<u32> {
    if logits.is_empty() {
        return Err(Error::InvalidRequest("cannot sample from empty logits".into()));
    }
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        let v = finite_or_neg_inf(v);
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    to_token(best)
}

fn to_token(index: usize) -> Result<u32> {
    u32::try_from(index).map_err(|_| Error::Other(format!("token index {index} overflows u32")))
}

/// Draw one token id from `logits`.
///
/// Consumes exactly one `f32` from `rng` unless decoding is greedy. NaN
/// logits are treated as `-inf`. If any logit is `+inf` the lowest such id
/// is returned.
///
/// # Errors
/// Returns an error for invalid parameters, empty logits, or logits with no
/// finite value.
pub fn sample<R: Rng + ?Sized>(logits: &[f32], params: &SamplingParams, rng: &mut R) -> Result<u32> {
    params.validate()?;
    if params.temperature == 0.0 {
        return argmax(logits);
    }
    if logits.is_empty() {
        return Err(Error::InvalidRequest("cannot sample from empty logits".into()));
    }
    let r: f32 = rng.gen();

    if let Some(i) = logits.iter().position(|&l| l == f32::INFINITY) {
        return to_token(i);
    }

    let mut candidates: Vec<(usize, f32)> = logits
        .iter()
        .map(|&l| finite_or_neg_inf(l))
        .enumerate()
        .collect();
    candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    if let Some(k) = params.top_k {
        candidates.truncate(k);
    }

    let max_logit = candidates[0].1;
    if max_logit == f32::NEG_INFINITY {
        return Err(Error::InvalidRequest("logits hold no finite value".into()));
    }
    // Shift before scaling so a tiny temperature cannot overflow.
    let mut probs: Vec<f32> = candidates
        .iter()
        .map(|&(_, l)| ((l - max_logit) / params.temperature).exp())
        .collect();
    let total: f32 = probs.iter().sum();
    if !total.is_finite() || total <= 0.0 {
        return Err(Error::Other(format!("softmax over logits summed to {total}")));
    }
    for p in &mut probs {
        *p /= total;
    }
    // Sorted descending, so the zero-probability entries form the tail.
    let support = probs.iter().take_while(|&&p| p > 0.0).count();
    probs.truncate(support);

    let mut cutoff = probs.len();
    let mut cumulative = 0.0_f32;
    for (i, p) in probs.iter().enumerate() {
        cumulative += p;
        if cumulative >= params.top_p {
            cutoff = i + 1;
            break;
        }
    }
    let nucleus = &probs[..cutoff];
    let nucleus_sum: f32 = nucleus.iter().sum();

    let mut cumul = 0.0_f32;
    for (i, p) in nucleus.iter().enumerate() {
        cumul += p / nucleus_sum;
        if r < cumul {
            return to_token(candidates[i].0);
        }
    }
    // Rounding left the cumulative sum just under 1.
    to_token(candidates[cutoff - 1].0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn params(temperature: f32, top_p: f32, top_k: Option<usize>) -> SamplingParams {
        SamplingParams {
            temperature,
            top_p,
            top_k,
            seed: 7,
        }
    }

    #[test]
    fn test_greedy_picks_lowest_id_on_ties() {
        let logits = [0.5, 2.0, -1.0, 2.0];
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..10 {
            assert_eq!(sample(&logits, &SamplingParams::greedy(), &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn test_argmax_ignores_nan() {
        assert_eq!(argmax(&[f32::NAN, 1.0, 0.0]).unwrap(), 1);
        assert!(argmax(&[]).is_err());
    }

    #[test]
    fn test_top_k_one_is_greedy() {
        let logits = [0.1, 0.3, 5.0, 0.2];
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            assert_eq!(sample(&logits, &params(1.5, 1.0, Some(1)), &mut rng).unwrap(), 2);
        }
    }

    #[test]
    fn test_top_p_cuts_the_tail() {
        // p ≈ [0.867, 0.117, 0.016]; top_p 0.5 keeps only the head.
        let logits = [4.0, 2.0, 0.0];
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            assert_eq!(sample(&logits, &params(1.0, 0.5, None), &mut rng).unwrap(), 0);
        }
    }

    #[test]
    fn test_top_k_restricts_support() {
        let logits = [1.0, 1.0, 1.0, 1.0, 1.0];
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let t = sample(&logits, &params(1.0, 1.0, Some(2)), &mut rng).unwrap();
            assert!(t < 2, "sampled {t} outside top-2");
        }
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let logits: Vec<f32> = (0..32).map(|i| (i % 5) as f32 * 0.3).collect();
        let p = params(0.9, 0.95, Some(10));
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..16)
                .map(|_| sample(&logits, &p, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(5), draw(5));
    }

    #[test]
    fn test_sampling_covers_the_support() {
        let logits = [0.0, 0.0, 0.0];
        let mut rng = StdRng::seed_from_u64(9);
        let mut seen = [false; 3];
        for _ in 0..300 {
            seen[sample(&logits, &params(1.0, 1.0, None), &mut rng).unwrap() as usize] = true;
        }
        assert_eq!(seen, [true, true, true]);
    }

    #[test]
    fn test_invalid_params() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sample(&[1.0], &params(-1.0, 1.0, None), &mut rng).is_err());
        assert!(sample(&[1.0], &params(1.0, 0.0, None), &mut rng).is_err());
        assert!(sample(&[1.0], &params(1.0, 1.0, Some(0)), &mut rng).is_err());
        assert!(sample(&[f32::NEG_INFINITY], &params(1.0, 1.0, None), &mut rng).is_err());
        assert!(sample(&[f32::NAN, f32::NEG_INFINITY], &params(1.0, 1.0, None), &mut rng).is_err());
    }

    #[test]
    fn test_infinite_logit_wins() {
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..20 {
            let t = sample(&[f32::INFINITY, 0.0, -1.0], &params(1.0, 1.0, None), &mut rng).unwrap();
            assert_eq!(t, 0);
            let t = sample(&[0.0, f32::INFINITY, f32::INFINITY], &params(0.7, 0.9, Some(2)), &mut rng).unwrap();
            assert_eq!(t, 1);
        }
    }

    #[test]
    fn test_tiny_temperature_is_greedy() {
        let mut rng = StdRng::seed_from_u64(8);
        for _ in 0..20 {
            assert_eq!(sample(&[10.0, -5.0], &params(1e-38, 1.0, None), &mut rng).unwrap(), 0);
            assert_eq!(sample(&[-5.0, 10.0, 9.0], &params(f32::MIN_POSITIVE, 0.9, None), &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn test_masked_logits_never_drawn() {
        let logits = [f32::NEG_INFINITY, 0.0, f32::NAN, 0.0, f32::NEG_INFINITY];
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..200 {
            let t = sample(&logits, &params(1.0, 1.0, None), &mut rng).unwrap();
            assert!(t == 1 || t == 3, "sampled masked id {t}");
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    proptest! {
        #[test]
        fn greedy_is_stable_and_minimal(logits in prop::collection::vec(-8i8..8, 1..64), seed in any::<u64>()) {
            let logits: Vec<f32> = logits.into_iter().map(f32::from).collect();
            let mut rng = StdRng::seed_from_u64(seed);
            let first = sample(&logits, &SamplingParams::greedy(), &mut rng).unwrap();
            let second = sample(&logits, &SamplingParams::greedy(), &mut rng).unwrap();
            prop_assert_eq!(first, second);
            let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let lowest = logits.iter().position(|&v| v == max).unwrap();
            prop_assert_eq!(first as usize, lowest);
        }

        #[test]
        fn sampled_token_is_in_vocab(logits in prop::collection::vec(-5.0f32..5.0, 1..64), seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let p = SamplingParams { temperature: 0.8, top_p: 0.9, top_k: Some(8), seed };
            let t = sample(&logits, &p, &mut rng).unwrap();
            prop_assert!((t as usize) < logits.len());
        }

        #[test]
        fn sampled_token_is_in_support(
            logits in prop::collection::vec(any::<f32>(), 1..32),
            temperature in prop_oneof![Just(f32::MIN_POSITIVE), Just(1e-30f32), 0.01f32..4.0],
            top_p in 0.01f32..=1.0,
            top_k in prop::option::of(1usize..8),
            seed in any::<u64>(),
        ) {
            let mut rng = StdRng::seed_from_u64(seed);
            let p = SamplingParams { temperature, top_p, top_k, seed };
            let usable = logits.iter().any(|l| !l.is_nan() && *l != f32::NEG_INFINITY);
            match sample(&logits, &p, &mut rng) {
                Ok(t) => {
                    let t = t as usize;
                    prop_assert!(t < logits.len());
                    if let Some(first_inf) = logits.iter().position(|&l| l == f32::INFINITY) {
                        prop_assert_eq!(t, first_inf);
                    } else {
                        prop_assert!(!logits[t].is_nan() && logits[t] != f32::NEG_INFINITY);
                        let higher = logits.iter().filter(|&&l| l > logits[t]).count();
                        prop_assert!(higher < top_k.unwrap_or(usize::MAX));
                    }
                    if top_k == Some(1) {
                        prop_assert_eq!(t, argmax(&logits).unwrap() as usize);
                    }
                }
                Err(_) => prop_assert!(!usable),
            }
        }
    }
}
