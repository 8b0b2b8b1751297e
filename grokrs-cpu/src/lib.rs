//! CPU backend for grokrs.
//!
//! Provides a pure-CPU inference path. All compute is done in f32; stored
//! bf16/f16/int8 weights are converted when the checkpoint is read. Model
//! parallelism runs one thread per rank, joined by the in-process
//! collectives in [`comm`].
//!
//! This backend is intended for debugging, testing, and running on
//! machines without an accelerator. It is not optimised for throughput.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod comm;
pub mod kernels;
pub mod logits;
pub mod ops;
pub mod tensor;

use grokrs::backend::Backend;

pub use comm::CpuComm;
pub use logits::CpuLogits;
pub use ops::attention::attention_probs;
pub use ops::kv_cache::CpuKvCache;
pub use tensor::CpuTensor;

/// Marker type for the CPU backend.
///
/// All op trait impls are on this type. Models parameterised by
/// `B: Backend` can use `CpuBackend` to run on CPU.
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Tensor = CpuTensor;
    type KvCache = CpuKvCache;
    type Logits = CpuLogits;
    type Comm = CpuComm;
}
