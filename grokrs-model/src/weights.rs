//! Weight names, shapes and partition specs, plus random initialisation and
//! checkpoint writing for test and demo models.
//!
//! Every matrix is stored `[in, out]`. Column-parallel projections split
//! their output axis over the model axis; row-parallel projections split
//! their input axis, so their outputs are partial sums.

#![allow(clippy::cast_precision_loss)]

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use grokrs::weights::CheckpointManifest;
use grokrs::{
    AxisSpec, CheckpointWriter, DType, DeviceMesh, Error, ExpectedTensor, HostTensor, MeshAxis,
    PartitionSpec, Result,
};

use crate::config::LanguageModelConfig;

pub const EMBEDDING: &str = "embedding";
pub const FINAL_NORM: &str = "final_norm";

/// Full name of a per-layer tensor, e.g. `layers.3.moe.router`.
#[must_use]
pub fn layer_weight(layer: usize, suffix: &str) -> String {
    format!("layers.{layer}.{suffix}")
}

pub const ATTN_QUERY: &str = "attn.query";
pub const ATTN_KEY: &str = "attn.key";
pub const ATTN_VALUE: &str = "attn.value";
pub const ATTN_LINEAR: &str = "attn.linear";
pub const MOE_ROUTER: &str = "moe.router";
pub const MOE_LINEAR: &str = "moe.linear";
pub const MOE_LINEAR_V: &str = "moe.linear_v";
pub const MOE_LINEAR_1: &str = "moe.linear_1";
/// Pre-attention, post-attention, pre-MoE and post-MoE norms.
pub const LAYER_NORMS: [&str; 4] = ["rms_norm", "rms_norm_1", "rms_norm_2", "rms_norm_3"];

const R: AxisSpec = AxisSpec::Replicate;
const M: AxisSpec = AxisSpec::Split(MeshAxis::Model);

fn spec(axes: &[AxisSpec]) -> PartitionSpec {
    PartitionSpec::new(axes.to_vec())
}

/// Every tensor a model with this config needs, with the shape the config
/// implies and how it is partitioned over a mesh.
#[must_use]
pub fn expected_tensors(config: &LanguageModelConfig) -> Vec<ExpectedTensor> {
    let t = &config.model;
    let emb = t.emb_size;
    let q_width = t.num_q_heads * t.key_size;
    let kv_width = t.num_kv_heads * t.key_size;
    let (experts, ffn) = (t.num_experts, t.ffn_size());

    let mut out = vec![ExpectedTensor::new(
        EMBEDDING,
        vec![config.vocab_size, emb],
        spec(&[R, M]),
    )];
    for i in 0..t.num_layers {
        let name = |suffix| layer_weight(i, suffix);
        out.push(ExpectedTensor::new(name(ATTN_QUERY), vec![emb, q_width], spec(&[R, M])));
        out.push(ExpectedTensor::new(name(ATTN_KEY), vec![emb, kv_width], spec(&[R, M])));
        out.push(ExpectedTensor::new(name(ATTN_VALUE), vec![emb, kv_width], spec(&[R, M])));
        out.push(ExpectedTensor::new(name(ATTN_LINEAR), vec![q_width, emb], spec(&[M, R])));
        out.push(ExpectedTensor::new(name(MOE_ROUTER), vec![emb, experts], spec(&[R, R])));
        out.push(ExpectedTensor::new(name(MOE_LINEAR), vec![experts, emb, ffn], spec(&[R, R, M])));
        out.push(ExpectedTensor::new(name(MOE_LINEAR_V), vec![experts, emb, ffn], spec(&[R, R, M])));
        out.push(ExpectedTensor::new(name(MOE_LINEAR_1), vec![experts, ffn, emb], spec(&[R, M, R])));
        for norm in LAYER_NORMS {
            out.push(ExpectedTensor::new(name(norm), vec![emb], spec(&[R])));
        }
    }
    out.push(ExpectedTensor::new(FINAL_NORM, vec![emb], spec(&[R])));
    out
}

/// Whether `name` is one of the expert projection tensors.
#[must_use]
pub fn is_expert_weight(name: &str) -> bool {
    [MOE_LINEAR, MOE_LINEAR_V, MOE_LINEAR_1]
        .iter()
        .any(|suffix| name.ends_with(suffix))
}

fn uniform(rng: &mut StdRng, shape: &[usize], std: f32) -> HostTensor {
    // Uniform on [-a, a] has standard deviation a / sqrt(3).
    let bound = std * 3.0_f32.sqrt();
    let n = shape.iter().product();
    HostTensor {
        shape: shape.to_vec(),
        data: (0..n).map(|_| rng.gen_range(-bound..=bound)).collect(),
    }
}

/// A full set of random weights, in [`expected_tensors`] order.
///
/// Projections get a spread of `1/sqrt(fan_in)`, the embedding one of
/// `embedding_init_scale`, and every norm weight starts at 1.
#[must_use]
pub fn init_random_weights(config: &LanguageModelConfig, seed: u64) -> Vec<(String, HostTensor)> {
    let mut rng = StdRng::seed_from_u64(seed);
    expected_tensors(config)
        .into_iter()
        .map(|e| {
            let tensor = match e.shape.len() {
                1 => HostTensor {
                    data: vec![1.0; e.shape[0]],
                    shape: e.shape.clone(),
                },
                _ if e.name == EMBEDDING => uniform(&mut rng, &e.shape, config.embedding_init_scale),
                rank => {
                    let fan_in = e.shape[rank - 2];
                    uniform(&mut rng, &e.shape, 1.0 / (fan_in as f32).sqrt())
                }
            };
            (e.name, tensor)
        })
        .collect()
}

/// Write `weights` as a checkpoint for `mesh`, with `config` embedded in the
/// manifest.
///
/// Expert projections are stored as int8 when `quantize_experts` is set;
/// everything else is stored as f32.
///
/// # Errors
/// Returns `WeightNotFound` if a tensor the config needs is missing from
/// `weights`, `ShapeMismatch` if one has the wrong shape, or an I/O error.
pub fn write_checkpoint(
    dir: impl AsRef<Path>,
    config: &LanguageModelConfig,
    weights: &[(String, HostTensor)],
    mesh: DeviceMesh,
    quantize_experts: bool,
) -> Result<CheckpointManifest> {
    config.validate()?;
    config.model.validate_for_mesh(&mesh)?;
    let mut writer = CheckpointWriter::new(dir, mesh)?.with_config(config)?;
    for e in expected_tensors(config) {
        let tensor = weights
            .iter()
            .find(|(name, _)| *name == e.name)
            .map(|(_, t)| t)
            .ok_or_else(|| Error::WeightNotFound(e.name.clone()))?;
        if tensor.shape != e.shape {
            return Err(Error::shape(&e.name, &e.shape, &tensor.shape));
        }
        if quantize_experts && is_expert_weight(&e.name) {
            writer.add_quantized(&e.name, tensor, e.partition)?;
        } else {
            writer.add(&e.name, tensor, e.partition, DType::F32)?;
        }
    }
    writer.finish()
}
