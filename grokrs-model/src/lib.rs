//! Grok-1 style mixture-of-experts transformer for grokrs backends

pub mod attention;
mod config;
mod model;
pub mod moe;
pub mod weights;

pub use config::{LanguageModelConfig, TransformerConfig};
pub use model::{load_config, load_sharded, GrokModel};
pub use weights::{expected_tensors, init_random_weights, write_checkpoint};

use grokrs::{
    ArithOps, AttentionOps, EmbedOps, GegluOps, KvCacheOps, MatmulOps, MoeOps, NormOps, RopeOps,
    TensorFactory, TensorOps,
};

/// Every op the Grok forward pass needs from a backend.
pub trait GrokOps:
    ArithOps
    + AttentionOps
    + EmbedOps
    + GegluOps
    + KvCacheOps
    + MatmulOps
    + MoeOps
    + NormOps
    + RopeOps
    + TensorFactory
    + TensorOps
{
}

impl<B> GrokOps for B where
    B: ArithOps
        + AttentionOps
        + EmbedOps
        + GegluOps
        + KvCacheOps
        + MatmulOps
        + MoeOps
        + NormOps
        + RopeOps
        + TensorFactory
        + TensorOps
{
}
