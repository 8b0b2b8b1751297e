//! grokrs: sharded mixture-of-experts transformer inference
//!
//! This crate provides the core types and traits: the backend op traits, the
//! device-mesh sharding layer, expert routing, the checkpoint format and the
//! sampler. Backend implementations and the model itself live in separate
//! crates.

#[allow(clippy::missing_errors_doc, clippy::doc_markdown)]
pub mod backend;
pub mod dtype;
pub mod error;
pub mod logits;
pub mod model;
pub mod moe;
pub mod rope;
pub mod sampling;
pub mod shard;
pub mod sharded;
pub mod tensor;
pub mod tokenizer;
pub mod weights;

pub use backend::{
    ArithOps, AttentionOps, Backend, Comm, EmbedOps, GegluOps, KvCache, KvCacheOps, MatmulOps,
    MoeOps, MultiDeviceOps, NormOps, RopeOps, TensorFactory, TensorOps,
};
pub use dtype::DType;
pub use error::{Error, Result};
pub use logits::Logits;
pub use model::{Model, ModelConfig};
pub use moe::{route_token, ExpertChoice, RouterDecision};
pub use sampling::{GenerateOptions, SamplingParams};
pub use shard::{
    AxisSpec, DeviceMesh, MeshAxis, MeshCoord, PartitionSpec, ShardConfig, ShardLayout,
};
pub use sharded::{ShardedKvCache, ShardedModel};
pub use tensor::Tensor;
pub use tokenizer::{ByteTokenizer, HfTokenizer, Tokenizer};
pub use weights::{CheckpointReader, CheckpointWriter, ExpectedTensor, HostTensor};
