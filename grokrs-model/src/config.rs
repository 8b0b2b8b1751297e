//! Grok model configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use grokrs::{DeviceMesh, Error, Result};

/// Architecture of the transformer stack.
///
/// Parsed from JSON (usually embedded in a checkpoint manifest). Call
/// [`validate`](Self::validate) before use; [`from_json`](Self::from_json)
/// and [`from_file`](Self::from_file) do so already.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Width of the residual stream
    pub emb_size: usize,

    /// Feed-forward expansion relative to `emb_size`
    pub widening_factor: f32,

    /// Per-head dimension of queries, keys and values
    pub key_size: usize,

    /// Number of query heads
    pub num_q_heads: usize,

    /// Number of key/value heads shared by groups of query heads
    pub num_kv_heads: usize,

    /// Number of transformer layers
    pub num_layers: usize,

    /// Scale applied to the attention-weighted values before the output projection
    #[serde(default = "default_attn_output_multiplier")]
    pub attn_output_multiplier: f32,

    /// Keep the residual stream split over the model axis between sub-blocks
    #[serde(default)]
    pub shard_activations: bool,

    /// Experts per MoE layer
    pub num_experts: usize,

    /// Experts each token is routed to
    pub num_selected_experts: usize,

    /// Name of the mesh axis carrying independent requests
    #[serde(default = "default_data_axis")]
    pub data_axis: String,

    /// Name of the mesh axis carrying weight shards
    #[serde(default = "default_model_axis")]
    pub model_axis: String,

    /// Rotary position embedding base frequency
    #[serde(default = "default_rope_base")]
    pub rope_base: f32,

    /// RMS norm epsilon
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f32,

    /// Attention logits are squashed to `c * tanh(x / c)` when set
    #[serde(default)]
    pub attn_logit_softcap: Option<f32>,
}

fn default_attn_output_multiplier() -> f32 {
    1.0
}

fn default_data_axis() -> String {
    "data".into()
}

fn default_model_axis() -> String {
    "model".into()
}

fn default_rope_base() -> f32 {
    10000.0
}

fn default_norm_eps() -> f32 {
    1e-5
}

fn default_scale() -> f32 {
    1.0
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::ConfigInvalid(msg.into())
}

impl TransformerConfig {
    /// Check every invariant the forward pass relies on.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.emb_size == 0 || self.num_layers == 0 {
            return Err(invalid("emb_size and num_layers must be positive"));
        }
        if self.num_q_heads == 0 || self.num_kv_heads == 0 {
            return Err(invalid("head counts must be positive"));
        }
        if self.emb_size % self.num_q_heads != 0 {
            return Err(invalid(format!(
                "emb_size {} is not divisible by num_q_heads {}",
                self.emb_size, self.num_q_heads
            )));
        }
        if self.num_q_heads % self.num_kv_heads != 0 {
            return Err(invalid(format!(
                "num_q_heads {} is not a multiple of num_kv_heads {}",
                self.num_q_heads, self.num_kv_heads
            )));
        }
        if self.key_size != self.head_dim() {
            return Err(invalid(format!(
                "key_size {} does not match emb_size / num_q_heads = {}",
                self.key_size,
                self.head_dim()
            )));
        }
        if self.key_size % 2 != 0 {
            return Err(invalid(format!(
                "rotary embedding needs an even key_size, got {}",
                self.key_size
            )));
        }
        if self.num_experts == 0 {
            return Err(invalid("num_experts must be positive"));
        }
        if self.num_selected_experts == 0 || self.num_selected_experts > self.num_experts {
            return Err(invalid(format!(
                "num_selected_experts {} must be in 1..={}",
                self.num_selected_experts, self.num_experts
            )));
        }
        if !(self.widening_factor.is_finite() && self.widening_factor > 0.0) || self.ffn_size() == 0 {
            return Err(invalid(format!(
                "widening_factor {} gives no feed-forward width",
                self.widening_factor
            )));
        }
        if !self.attn_output_multiplier.is_finite() {
            return Err(invalid("attn_output_multiplier must be finite"));
        }
        if !(self.rope_base > 0.0 && self.norm_eps > 0.0) {
            return Err(invalid("rope_base and norm_eps must be positive"));
        }
        if let Some(cap) = self.attn_logit_softcap {
            if !(cap.is_finite() && cap > 0.0) {
                return Err(invalid(format!("attn_logit_softcap {cap} must be positive")));
            }
        }
        if self.data_axis.is_empty() || self.model_axis.is_empty() || self.data_axis == self.model_axis {
            return Err(invalid(format!(
                "mesh axes need two distinct names, got {:?} and {:?}",
                self.data_axis, self.model_axis
            )));
        }
        Ok(())
    }

    /// Check that every model-axis split of this architecture divides evenly
    /// on `mesh`.
    ///
    /// # Errors
    /// Returns `UnevenShard` for the first dimension the model axis does not
    /// divide.
    pub fn validate_for_mesh(&self, mesh: &DeviceMesh) -> Result<()> {
        let shards = mesh.model;
        for len in [
            self.num_q_heads,
            self.num_kv_heads,
            self.ffn_size(),
            self.emb_size,
        ] {
            if len % shards != 0 {
                return Err(Error::UnevenShard { axis: 0, len, shards });
            }
        }
        Ok(())
    }

    /// Per-head dimension, `emb_size / num_q_heads`.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.emb_size / self.num_q_heads.max(1)
    }

    /// Query heads per key/value head.
    #[must_use]
    pub fn num_heads_per_kv(&self) -> usize {
        self.num_q_heads / self.num_kv_heads.max(1)
    }

    /// Hidden width of one expert: two thirds of the widened size, rounded
    /// up to a multiple of 8.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn ffn_size(&self) -> usize {
        let widened = (f64::from(self.widening_factor) * self.emb_size as f64) as usize;
        (widened * 2 / 3).div_ceil(8) * 8
    }

    /// Load and validate from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or is invalid
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Parse and validate from JSON text
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or the config is invalid
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// A transformer wrapped with its vocabulary and the scalar scales of the
/// embedding and unembedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageModelConfig {
    pub model: TransformerConfig,

    /// Vocabulary size
    pub vocab_size: usize,

    /// Padding token ID
    pub pad_token: u32,

    /// End of sequence token ID
    pub eos_token: u32,

    /// Maximum sequence length, prompt included
    pub sequence_len: usize,

    /// Scale of the random embedding initialisation
    #[serde(default = "default_scale")]
    pub embedding_init_scale: f32,

    /// Embedding vectors are multiplied by this after lookup
    #[serde(default = "default_scale")]
    pub embedding_multiplier_scale: f32,

    /// Logits are multiplied by this after unembedding
    #[serde(default = "default_scale")]
    pub output_multiplier_scale: f32,
}

impl LanguageModelConfig {
    /// Build a validated config with unit scaling constants.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` if any invariant is violated.
    pub fn new(
        model: TransformerConfig,
        vocab_size: usize,
        pad_token: u32,
        eos_token: u32,
        sequence_len: usize,
    ) -> Result<Self> {
        let config = Self {
            model,
            vocab_size,
            pad_token,
            eos_token,
            sequence_len,
            embedding_init_scale: 1.0,
            embedding_multiplier_scale: 1.0,
            output_multiplier_scale: 1.0,
        };
        config.validate()?;
        Ok(config)
    }

    /// The Grok-1 release configuration.
    #[must_use]
    pub fn grok1() -> Self {
        Self {
            model: TransformerConfig {
                emb_size: 6144,
                widening_factor: 8.0,
                key_size: 128,
                num_q_heads: 48,
                num_kv_heads: 8,
                num_layers: 64,
                attn_output_multiplier: 0.088_388_35,
                shard_activations: true,
                num_experts: 8,
                num_selected_experts: 2,
                data_axis: default_data_axis(),
                model_axis: default_model_axis(),
                rope_base: default_rope_base(),
                norm_eps: default_norm_eps(),
                attn_logit_softcap: Some(30.0),
            },
            vocab_size: 128 * 1024,
            pad_token: 0,
            eos_token: 2,
            sequence_len: 8192,
            embedding_init_scale: 1.0,
            embedding_multiplier_scale: 78.383_67,
            output_multiplier_scale: 0.577_350_26,
        }
    }

    /// # Errors
    /// Returns `ConfigInvalid` naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        if self.vocab_size == 0 || self.sequence_len == 0 {
            return Err(invalid("vocab_size and sequence_len must be positive"));
        }
        for (what, id) in [("pad_token", self.pad_token), ("eos_token", self.eos_token)] {
            if id as usize >= self.vocab_size {
                return Err(invalid(format!(
                    "{what} {id} outside vocabulary of {}",
                    self.vocab_size
                )));
            }
        }
        if self.pad_token == self.eos_token {
            return Err(invalid(format!(
                "pad_token and eos_token are both {}",
                self.pad_token
            )));
        }
        for scale in [
            self.embedding_init_scale,
            self.embedding_multiplier_scale,
            self.output_multiplier_scale,
        ] {
            if !scale.is_finite() {
                return Err(invalid("scaling constants must be finite"));
            }
        }
        Ok(())
    }

    /// Load and validate from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or is invalid
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Parse and validate from JSON text
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or the config is invalid
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// The view of this config the runner and engine need.
    #[must_use]
    pub fn model_config(&self) -> grokrs::ModelConfig {
        grokrs::ModelConfig {
            num_layers: self.model.num_layers,
            max_seq_len: self.sequence_len,
            num_kv_heads: self.model.num_kv_heads,
            head_dim: self.model.head_dim(),
            vocab_size: self.vocab_size,
            eos_token_id: self.eos_token,
            pad_token_id: self.pad_token,
        }
    }
}
