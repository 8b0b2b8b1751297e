//! Single-request inference runner
//!
//! An [`InferenceRunner`] drives one generation request through a model:
//! one prefill pass over the prompt, then one decode step per generated
//! token, sampling each next token from the model's logits. It owns the
//! request's KV cache from prefill until the request ends.
//!
//! ```text
//! Idle ──prefill──▶ Prefilling ──▶ Decoding ──step…──▶ Done(reason)
//!                        │              │
//!                        └────error─────┴──▶ Failed
//! ```

use rand::rngs::StdRng;
use rand::SeedableRng;

use grokrs::{Error, GenerateOptions, KvCache, Logits, Model, Result, SamplingParams};

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Model produced the end-of-sequence token.
    Stop,
    /// Reached the token budget or the sequence capacity.
    Length,
    /// The caller abandoned the request between steps.
    Cancelled,
}

/// Where a runner is in its request's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Prefilling,
    Decoding,
    Done(FinishReason),
    Failed,
}

/// Drives one generation request against a shared, read-only model.
pub struct InferenceRunner<'m, M: Model> {
    model: &'m M,
    max_new_tokens: usize,
    eos_token_id: u32,
    params: SamplingParams,
    rng: StdRng,
    capacity: usize,
    cache: Option<M::KvCache>,
    state: RunnerState,
    prompt_len: usize,
    /// Sampled but not yet fed back through the model.
    pending: Option<u32>,
    output: Vec<u32>,
}

impl<'m, M: Model> InferenceRunner<'m, M> {
    /// Create an idle runner.
    ///
    /// `max_seq_len` caps the KV cache (prompt plus output); it defaults to
    /// and may not exceed the model's maximum sequence length. The EOS token
    /// defaults to the model's.
    ///
    /// # Errors
    /// Returns `InvalidRequest` for invalid sampling parameters.
    pub fn new(model: &'m M, options: &GenerateOptions, max_seq_len: Option<usize>) -> Result<Self> {
        let config = model.config();
        let params = options.sampling_params();
        params.validate()?;
        let capacity = max_seq_len.map_or(config.max_seq_len, |n| n.min(config.max_seq_len));
        Ok(Self {
            model,
            max_new_tokens: options.max_new_tokens,
            eos_token_id: options.eos_token_id.unwrap_or(config.eos_token_id),
            rng: StdRng::seed_from_u64(params.seed),
            params,
            capacity,
            cache: None,
            state: RunnerState::Idle,
            prompt_len: 0,
            pending: None,
            output: Vec::new(),
        })
    }

    #[must_use]
    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Tokens generated so far, excluding the prompt and any EOS.
    #[must_use]
    pub fn output(&self) -> &[u32] {
        &self.output
    }

    /// Positions currently held in the KV cache; zero once it is released.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.as_ref().map_or(0, KvCache::len)
    }

    /// Run the prompt through the model and sample the first token.
    ///
    /// Returns the token appended to the output, or `None` if generation
    /// finished without one (EOS, or no room left).
    ///
    /// # Errors
    /// * `InvalidState` unless the runner is idle.
    /// * `InvalidRequest` for an empty prompt.
    /// * `SequenceTooLong` if the prompt exceeds the cache capacity.
    /// * Any model error; the runner is then `Failed`.
    pub fn prefill(&mut self, prompt: &[u32]) -> Result<Option<u32>> {
        if self.state != RunnerState::Idle {
            return Err(Error::InvalidState(format!(
                "prefill requires an idle runner, state is {:?}",
                self.state
            )));
        }
        self.state = RunnerState::Prefilling;
        let result = self.try_prefill(prompt);
        self.settle(result)
    }

    fn try_prefill(&mut self, prompt: &[u32]) -> Result<Option<u32>> {
        if prompt.is_empty() {
            return Err(Error::InvalidRequest("empty prompt".into()));
        }
        if prompt.len() > self.capacity {
            return Err(Error::SequenceTooLong {
                len: prompt.len(),
                max: self.capacity,
            });
        }
        tracing::debug!(prompt_len = prompt.len(), capacity = self.capacity, "prefill");
        self.prompt_len = prompt.len();
        let mut cache = self.model.allocate_kv_cache(self.capacity)?;
        let logits = self.model.forward_prefill(prompt, &mut cache)?;
        self.cache = Some(cache);
        self.accept(&logits)
    }

    /// Feed the last sampled token back and sample the next one.
    ///
    /// Returns the token appended to the output, or `None` if generation
    /// finished without one.
    ///
    /// # Errors
    /// * `InvalidState` unless the runner is decoding.
    /// * Any model error; the runner is then `Failed`.
    pub fn step(&mut self) -> Result<Option<u32>> {
        if self.state != RunnerState::Decoding {
            return Err(Error::InvalidState(format!(
                "step requires a decoding runner, state is {:?}",
                self.state
            )));
        }
        let result = self.try_step();
        self.settle(result)
    }

    fn try_step(&mut self) -> Result<Option<u32>> {
        let (Some(token), Some(cache)) = (self.pending.take(), self.cache.as_mut()) else {
            return Err(Error::InvalidState("decoding without a pending token".into()));
        };
        let logits = self.model.forward_decode(token, cache)?;
        self.accept(&logits)
    }

    /// Sample from `logits` and decide whether generation continues.
    fn accept(&mut self, logits: &<M::B as grokrs::Backend>::Logits) -> Result<Option<u32>> {
        if self.output.len() >= self.max_new_tokens || self.prompt_len >= self.capacity {
            self.finish(FinishReason::Length);
            return Ok(None);
        }
        let row = logits.batch_size().saturating_sub(1);
        let token = logits.sample(row, &self.params, &mut self.rng)?;
        if token == self.eos_token_id {
            self.finish(FinishReason::Stop);
            return Ok(None);
        }
        self.output.push(token);
        if self.output.len() >= self.max_new_tokens
            || self.prompt_len + self.output.len() >= self.capacity
        {
            self.finish(FinishReason::Length);
        } else {
            self.pending = Some(token);
            self.state = RunnerState::Decoding;
        }
        Ok(Some(token))
    }

    fn finish(&mut self, reason: FinishReason) {
        tracing::debug!(?reason, generated = self.output.len(), "generation finished");
        self.pending = None;
        self.state = RunnerState::Done(reason);
    }

    fn settle(&mut self, result: Result<Option<u32>>) -> Result<Option<u32>> {
        if let Err(e) = &result {
            tracing::debug!(error = %e, "generation failed");
            self.state = RunnerState::Failed;
            self.pending = None;
            self.cache = None;
        }
        result
    }

    /// Abandon the request between steps and release its cache.
    ///
    /// # Errors
    /// Returns `InvalidState` if the request already finished or failed.
    pub fn cancel(&mut self) -> Result<()> {
        if matches!(self.state, RunnerState::Done(_) | RunnerState::Failed) {
            return Err(Error::InvalidState(format!(
                "cannot cancel a runner in state {:?}",
                self.state
            )));
        }
        self.cache = None;
        self.finish(FinishReason::Cancelled);
        Ok(())
    }

    /// Prefill `prompt` and decode until done, handing each token to
    /// `on_token`. Returning `false` from `on_token` cancels the request.
    ///
    /// # Errors
    /// Returns the first error raised by prefill or a decode step.
    pub fn run(
        &mut self,
        prompt: &[u32],
        mut on_token: impl FnMut(u32) -> bool,
    ) -> Result<FinishReason> {
        let mut next = self.prefill(prompt)?;
        loop {
            if let Some(token) = next {
                if !on_token(token) && self.state == RunnerState::Decoding {
                    self.cancel()?;
                    return Ok(FinishReason::Cancelled);
                }
            }
            match self.state {
                RunnerState::Done(reason) => return Ok(reason),
                RunnerState::Decoding => next = self.step()?,
                state => {
                    return Err(Error::InvalidState(format!(
                        "runner stopped in state {state:?}"
                    )))
                }
            }
        }
    }
}
