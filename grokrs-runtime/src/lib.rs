//! grokrs runtime: text-in, text-out inference
//!
//! This crate provides the [`InferenceRunner`] (one request), the
//! [`Engine`] (token-level, data-parallel) and the [`Runtime`] (text-level)
//! abstractions for running inference.
//!
//! # Architecture
//!
//! ```text
//! Runtime<T>                  ← text in, text out (owns Engine + Tokenizer)
//!   └── Engine                ← tokens in, tokens out (one worker per replica)
//!         └── InferenceRunner ← prefill, decode, sample (owns the KV cache)
//!               └── M: Model  ← forward pass only
//! ```

mod engine;
mod runner;
mod runtime;
#[cfg(test)]
mod testing;

pub use engine::{Engine, GenerationEvent, TokenSender};
pub use runner::{FinishReason, InferenceRunner, RunnerState};
pub use runtime::Runtime;
