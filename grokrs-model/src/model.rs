//! Grok model: the transformer stack and language model head for one
//! model-axis shard.
//!
//! Every replica runs the same sequence of collectives, in the same order,
//! on its group's communicator. With `shard_activations` the residual
//! stream between sub-blocks holds only this rank's slice of the embedding
//! axis; otherwise it is replicated.

#![allow(
    clippy::doc_markdown, // tensor shape docs trigger false positives
    clippy::module_name_repetitions
)]

use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use grokrs::model::validate_input;
use grokrs::weights::{host_transpose_2d, CheckpointReader, WeightShard};
use grokrs::{
    Backend, Comm, DeviceMesh, Error, HostTensor, KvCache, Model, ModelConfig, MultiDeviceOps,
    Result, ShardConfig, ShardedModel,
};

use crate::attention::{AttentionBlock, RopeTables};
use crate::config::LanguageModelConfig;
use crate::moe::{ExpertWeights, MoeBlock};
use crate::weights::{
    expected_tensors, layer_weight, ATTN_KEY, ATTN_LINEAR, ATTN_QUERY, ATTN_VALUE, EMBEDDING,
    FINAL_NORM, LAYER_NORMS, MOE_LINEAR, MOE_LINEAR_1, MOE_LINEAR_V, MOE_ROUTER,
};
use crate::GrokOps;

/// Weights for a single decoder layer
struct GrokLayer<B: Backend> {
    pre_attn_norm: B::Tensor,
    attention: AttentionBlock<B>,
    post_attn_norm: B::Tensor,
    pre_moe_norm: B::Tensor,
    moe: MoeBlock<B>,
    post_moe_norm: B::Tensor,
}

/// One model-axis shard of a Grok model.
pub struct GrokModel<B: Backend> {
    config: LanguageModelConfig,
    shard: ShardConfig,
    comm: Option<B::Comm>,
    local_kv_heads: usize,

    // [vocab, emb / shards]
    embedding: B::Tensor,
    // Tied: the transposed embedding, [emb / shards, vocab]
    unembedding: B::Tensor,

    layers: Vec<GrokLayer<B>>,
    final_norm: B::Tensor,
    rope: RopeTables<B>,
}

fn upload<B: GrokOps>(weights: &mut WeightShard, name: &str) -> Result<B::Tensor> {
    B::from_host(&weights.take(name)?)
}

/// Split a stacked `[experts, rows, cols]` tensor into one matrix per expert.
fn split_experts<B: GrokOps>(stacked: &HostTensor) -> Result<Vec<B::Tensor>> {
    let &[experts, rows, cols] = stacked.shape.as_slice() else {
        return Err(Error::Other(format!(
            "expert weights must be 3D, got {:?}",
            stacked.shape
        )));
    };
    let per_expert = rows * cols;
    (0..experts)
        .map(|e| {
            B::from_f32_slice(
                &[rows, cols],
                &stacked.data[e * per_expert..(e + 1) * per_expert],
            )
        })
        .collect()
}

impl<B: GrokOps> GrokModel<B> {
    /// Build this rank's replica from its restored weight shard.
    ///
    /// `comm` must belong to the model-axis group of `weights.coord`; it may
    /// be `None` only on a mesh with a single model-axis rank.
    ///
    /// # Errors
    /// Returns an error if the config is invalid, a weight is missing, or
    /// the communicator does not match the shard's position.
    pub fn from_shard(
        config: LanguageModelConfig,
        mut weights: WeightShard,
        comm: Option<B::Comm>,
    ) -> Result<Self> {
        config.validate()?;
        config.model.validate_for_mesh(&weights.mesh)?;
        let shard = weights.mesh.shard_config(weights.coord);
        match &comm {
            Some(c) if c.rank() != shard.rank || c.world_size() != shard.world_size => {
                return Err(Error::Comm(format!(
                    "communicator rank {}/{} does not match shard {}/{}",
                    c.rank(),
                    c.world_size(),
                    shard.rank,
                    shard.world_size
                )));
            }
            None if shard.world_size > 1 => {
                return Err(Error::Comm(format!(
                    "a {}-way model shard needs a communicator",
                    shard.world_size
                )));
            }
            _ => {}
        }

        let t = &config.model;
        let head_dim = t.head_dim();
        let local_heads = t.num_q_heads / shard.world_size;
        let local_kv_heads = t.num_kv_heads / shard.world_size;

        let embedding_host = weights.take(EMBEDDING)?;
        let unembedding = B::from_host(&host_transpose_2d(&embedding_host)?)?;
        let embedding = B::from_host(&embedding_host)?;

        let mut layers = Vec::with_capacity(t.num_layers);
        for i in 0..t.num_layers {
            let name = |suffix| layer_weight(i, suffix);
            let [n0, n1, n2, n3] = LAYER_NORMS.map(|norm| layer_weight(i, norm));

            let attention = AttentionBlock {
                query: upload::<B>(&mut weights, &name(ATTN_QUERY))?,
                key: upload::<B>(&mut weights, &name(ATTN_KEY))?,
                value: upload::<B>(&mut weights, &name(ATTN_VALUE))?,
                linear: upload::<B>(&mut weights, &name(ATTN_LINEAR))?,
                num_heads: local_heads,
                num_kv_heads: local_kv_heads,
                head_dim,
                output_multiplier: t.attn_output_multiplier,
                softcap: t.attn_logit_softcap,
            };

            let linear = split_experts::<B>(&weights.take(&name(MOE_LINEAR))?)?;
            let linear_v = split_experts::<B>(&weights.take(&name(MOE_LINEAR_V))?)?;
            let linear_1 = split_experts::<B>(&weights.take(&name(MOE_LINEAR_1))?)?;
            let experts = linear
                .into_iter()
                .zip(linear_v)
                .zip(linear_1)
                .map(|((linear, linear_v), linear_1)| ExpertWeights {
                    linear,
                    linear_v,
                    linear_1,
                })
                .collect();
            let moe = MoeBlock {
                router: upload::<B>(&mut weights, &name(MOE_ROUTER))?,
                experts,
                num_selected: t.num_selected_experts,
            };

            layers.push(GrokLayer {
                pre_attn_norm: upload::<B>(&mut weights, &n0)?,
                attention,
                post_attn_norm: upload::<B>(&mut weights, &n1)?,
                pre_moe_norm: upload::<B>(&mut weights, &n2)?,
                moe,
                post_moe_norm: upload::<B>(&mut weights, &n3)?,
            });
        }

        let final_norm = upload::<B>(&mut weights, FINAL_NORM)?;
        let rope = RopeTables::new(config.sequence_len, head_dim, t.rope_base)?;

        tracing::debug!(
            coord = %weights.coord,
            layers = layers.len(),
            local_heads,
            local_kv_heads,
            "model shard ready"
        );

        Ok(Self {
            config,
            shard,
            comm,
            local_kv_heads,
            embedding,
            unembedding,
            layers,
            final_norm,
            rope,
        })
    }

    /// The full model configuration.
    #[must_use]
    pub fn grok_config(&self) -> &LanguageModelConfig {
        &self.config
    }

    /// This replica's position in its model-axis group.
    #[must_use]
    pub fn shard(&self) -> ShardConfig {
        self.shard
    }

    fn shards_stream(&self) -> bool {
        self.config.model.shard_activations && self.comm.is_some()
    }

    /// This rank's slice of a full `[rows, emb]` tensor.
    fn local_slice(&self, full: &B::Tensor) -> Result<B::Tensor> {
        let width = self.config.model.emb_size / self.shard.world_size;
        B::slice_last_dim(full, self.shard.rank * width, width)
    }

    /// Full `[seq, emb]` view of the residual stream.
    fn gather_stream(&self, h: &B::Tensor) -> Result<B::Tensor> {
        match &self.comm {
            Some(comm) if self.shards_stream() => comm.all_gather_last_dim(h),
            _ => Ok(h.clone()),
        }
    }

    /// Sum a row-parallel partial output across the model axis, normalise
    /// it, and lay it out like the residual stream.
    fn reduce_and_norm(&self, partial: B::Tensor, weight: &B::Tensor) -> Result<B::Tensor> {
        let eps = self.config.model.norm_eps;
        match &self.comm {
            Some(comm) if self.shards_stream() => {
                let local = comm.reduce_scatter_last_dim(&partial)?;
                // The norm needs statistics over the whole embedding axis.
                let full = comm.all_gather_last_dim(&local)?;
                self.local_slice(&B::rms_norm(&full, weight, eps)?)
            }
            Some(comm) => {
                let mut full = partial;
                comm.all_reduce_sum(&mut full)?;
                B::rms_norm(&full, weight, eps)
            }
            None => B::rms_norm(&partial, weight, eps),
        }
    }

    /// Embed token IDs, scaled, in the residual stream's layout
    fn embed(&self, input_ids: &[u32]) -> Result<B::Tensor> {
        let mut local = B::embedding_gather(&self.embedding, input_ids)?;
        B::scale_inplace(&mut local, self.config.embedding_multiplier_scale)?;
        match &self.comm {
            Some(comm) if !self.shards_stream() => comm.all_gather_last_dim(&local),
            _ => Ok(local),
        }
    }

    /// Forward pass through a single transformer layer
    fn forward_layer(
        &self,
        hidden: B::Tensor,
        layer: &GrokLayer<B>,
        layer_idx: usize,
        position_offset: usize,
        cache: Option<&mut B::KvCache>,
    ) -> Result<B::Tensor> {
        let eps = self.config.model.norm_eps;

        let normed = B::rms_norm(&self.gather_stream(&hidden)?, &layer.pre_attn_norm, eps)?;
        let attn = layer.attention.forward(
            &normed,
            &self.rope,
            position_offset,
            cache.map(|c| (c, layer_idx)),
        )?;
        let mut hidden = hidden;
        B::add_inplace(&mut hidden, &self.reduce_and_norm(attn, &layer.post_attn_norm)?)?;

        let normed = B::rms_norm(&self.gather_stream(&hidden)?, &layer.pre_moe_norm, eps)?;
        let moe = layer.moe.forward(&normed)?;
        B::add_inplace(&mut hidden, &self.reduce_and_norm(moe, &layer.post_moe_norm)?)?;
        Ok(hidden)
    }

    /// Run the stack and return the final-normed hidden states, `[seq, emb]`.
    ///
    /// With a cache, positions continue from its cursor and the cursor moves
    /// only after every layer has succeeded.
    fn forward_hidden(
        &self,
        input_ids: &[u32],
        mut cache: Option<&mut B::KvCache>,
    ) -> Result<B::Tensor> {
        let position_offset = cache.as_ref().map_or(0, |c| c.len());
        let mut hidden = self.embed(input_ids)?;
        for (i, layer) in self.layers.iter().enumerate() {
            hidden = self.forward_layer(hidden, layer, i, position_offset, cache.as_deref_mut())?;
        }
        if let Some(cache) = cache {
            B::advance(cache, input_ids.len())?;
            tracing::trace!(len = cache.len(), "kv cursor advanced");
        }
        B::rms_norm(
            &self.gather_stream(&hidden)?,
            &self.final_norm,
            self.config.model.norm_eps,
        )
    }

    /// Project hidden states onto the vocabulary and apply the output scale.
    fn lm_head_forward(&self, hidden: &B::Tensor) -> Result<B::Logits> {
        let mut logits = B::matmul(&self.local_slice(hidden)?, &self.unembedding)?;
        if let Some(comm) = &self.comm {
            comm.all_reduce_sum(&mut logits)?;
        }
        B::scale_inplace(&mut logits, self.config.output_multiplier_scale)?;
        B::into_logits(logits)
    }
}

impl<B: GrokOps> Model for GrokModel<B> {
    type B = B;
    type KvCache = B::KvCache;

    fn config(&self) -> ModelConfig {
        self.config.model_config()
    }

    fn allocate_kv_cache(&self, capacity: usize) -> Result<B::KvCache> {
        if capacity > self.config.sequence_len {
            return Err(Error::SequenceTooLong {
                len: capacity,
                max: self.config.sequence_len,
            });
        }
        B::allocate_kv_cache(
            self.config.model.num_layers,
            capacity,
            self.local_kv_heads,
            self.config.model.head_dim(),
        )
    }

    fn forward(&self, input_ids: &[u32]) -> Result<B::Logits> {
        validate_input(
            input_ids,
            self.config.vocab_size,
            0,
            self.config.sequence_len,
        )?;
        let hidden = self.forward_hidden(input_ids, None)?;
        self.lm_head_forward(&hidden)
    }

    fn forward_prefill(&self, input_ids: &[u32], kv_cache: &mut B::KvCache) -> Result<B::Logits> {
        validate_input(
            input_ids,
            self.config.vocab_size,
            kv_cache.len(),
            kv_cache.capacity(),
        )?;
        let hidden = self.forward_hidden(input_ids, Some(kv_cache))?;
        self.lm_head_forward(&B::last_row(&hidden)?)
    }
}

fn config_of(reader: &CheckpointReader) -> Result<LanguageModelConfig> {
    let config: LanguageModelConfig = reader.config()?.ok_or_else(|| {
        Error::ConfigInvalid("checkpoint manifest carries no model config".into())
    })?;
    config.validate()?;
    Ok(config)
}

/// Read and validate the model config embedded in a checkpoint.
///
/// # Errors
/// Returns an error if the manifest is unreadable or the config is missing
/// or invalid.
pub fn load_config(dir: impl AsRef<Path>) -> Result<LanguageModelConfig> {
    config_of(&CheckpointReader::open(dir)?)
}

/// Restore a checkpoint onto `mesh`, which may differ from the mesh it was
/// saved for.
///
/// Returns one tensor-parallel model per data-axis row, each with its own
/// communicator group. Every tensor is validated and restored before any
/// replica is built, so a failure leaves nothing half-loaded.
///
/// # Errors
/// * `ConfigInvalid` if the embedded config is missing or invalid.
/// * `UnevenShard` if the model axis does not divide the architecture.
/// * `WeightNotFound` / `ShapeMismatch` if the stored tensors do not match
///   the config.
pub fn load_sharded<B>(dir: impl AsRef<Path>, mesh: DeviceMesh) -> Result<Vec<ShardedModel<GrokModel<B>>>>
where
    B: GrokOps + MultiDeviceOps,
{
    let start = Instant::now();
    let reader = CheckpointReader::open(dir)?;
    let config = config_of(&reader)?;
    config.model.validate_for_mesh(&mesh)?;
    let weights = reader.restore(&expected_tensors(&config), &mesh)?;

    // Shards come data-major, so each run of `mesh.model` is one data row.
    let mut shards = weights.into_shards().into_iter();
    let mut replicas = Vec::with_capacity(mesh.data);
    for row in 0..mesh.data {
        let slots: Vec<Mutex<Option<WeightShard>>> = shards
            .by_ref()
            .take(mesh.model)
            .map(|s| Mutex::new(Some(s)))
            .collect();
        let config = &config;
        let slots = &slots;
        let model = ShardedModel::<GrokModel<B>>::load(mesh.model, move |shard_config, comm| {
            let shard = slots
                .get(shard_config.rank)
                .and_then(|slot| slot.lock().ok()?.take())
                .ok_or_else(|| {
                    Error::Other(format!("no weights for rank {}", shard_config.rank))
                })?;
            GrokModel::<B>::from_shard(config.clone(), shard, Some(comm))
        })?;
        tracing::debug!(row, "data replica ready");
        replicas.push(model);
    }

    tracing::info!(
        mesh = %mesh,
        layers = config.model.num_layers,
        experts = config.model.num_experts,
        elapsed_ms = start.elapsed().as_millis(),
        "model loaded"
    );
    Ok(replicas)
}
