//! End-to-end tests of the Grok model on the CPU backend, using tiny random
//! checkpoints.

use grokrs::{DeviceMesh, Error, KvCache, Model, ShardedModel};
use grokrs_cpu::{CpuBackend, CpuLogits};
use grokrs_model::{
    init_random_weights, load_config, load_sharded, write_checkpoint, GrokModel,
    LanguageModelConfig, TransformerConfig,
};
use tempfile::TempDir;

type CpuGrok = ShardedModel<GrokModel<CpuBackend>>;

fn tiny_config(shard_activations: bool) -> LanguageModelConfig {
    let mut config = LanguageModelConfig::new(
        TransformerConfig {
            emb_size: 8,
            widening_factor: 2.0,
            key_size: 2,
            num_q_heads: 4,
            num_kv_heads: 2,
            num_layers: 2,
            attn_output_multiplier: 0.5,
            shard_activations,
            num_experts: 4,
            num_selected_experts: 2,
            data_axis: "data".into(),
            model_axis: "model".into(),
            rope_base: 10000.0,
            norm_eps: 1e-5,
            attn_logit_softcap: Some(30.0),
        },
        32,
        0,
        2,
        16,
    )
    .unwrap();
    config.embedding_multiplier_scale = 1.5;
    config.output_multiplier_scale = 0.5;
    config
}

fn checkpoint(config: &LanguageModelConfig, mesh: DeviceMesh, quantize: bool) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let weights = init_random_weights(config, 17);
    write_checkpoint(dir.path(), config, &weights, mesh, quantize).unwrap();
    dir
}

fn load_one(dir: &TempDir, mesh: DeviceMesh) -> CpuGrok {
    load_sharded::<CpuBackend>(dir.path(), mesh)
        .unwrap()
        .into_iter()
        .next()
        .unwrap()
}

fn values(logits: &CpuLogits) -> Vec<f32> {
    logits.as_slice().to_vec()
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "index {i}: {x} vs {y}");
    }
}

const PROMPT: [u32; 5] = [5, 9, 3, 17, 30];

#[test]
fn test_forward_shapes() {
    let dir = checkpoint(&tiny_config(false), DeviceMesh::single(), false);
    let model = load_one(&dir, DeviceMesh::single());
    let logits = model.forward(&PROMPT).unwrap();
    assert_eq!(logits.as_slice().len(), PROMPT.len() * 32);
    assert!(logits.as_slice().iter().all(|x| x.is_finite()));
    assert_eq!(model.config().head_dim, 2);
}

#[test]
fn test_cached_decode_matches_full_forward() {
    let dir = checkpoint(&tiny_config(false), DeviceMesh::single(), false);
    let model = load_one(&dir, DeviceMesh::single());
    let full = values(&model.forward(&PROMPT).unwrap());

    let mut cache = model.allocate_kv_cache(16).unwrap();
    let mut stepped = values(&model.forward_prefill(&PROMPT[..3], &mut cache).unwrap());
    assert_eq!(cache.len(), 3);
    for &token in &PROMPT[3..] {
        stepped.extend(values(&model.forward_decode(token, &mut cache).unwrap()));
    }
    assert_eq!(cache.len(), 5);
    assert_close(&full[2 * 32..], &stepped, 1e-4);
}

#[test]
fn test_later_tokens_do_not_change_earlier_logits() {
    let dir = checkpoint(&tiny_config(false), DeviceMesh::single(), false);
    let model = load_one(&dir, DeviceMesh::single());
    let a = values(&model.forward(&PROMPT).unwrap());
    let mut changed = PROMPT;
    changed[4] = 1;
    changed[3] = 8;
    let b = values(&model.forward(&changed).unwrap());
    assert_eq!(&a[..3 * 32], &b[..3 * 32]);
    assert_ne!(&a[4 * 32..], &b[4 * 32..]);
}

#[test]
fn test_two_way_model_parallel_matches_single_device() {
    for shard_activations in [false, true] {
        let config = tiny_config(shard_activations);
        let dir = checkpoint(&config, DeviceMesh::single(), false);
        let single = load_one(&dir, DeviceMesh::single());
        let split = load_one(&dir, DeviceMesh::new(1, 2).unwrap());
        assert_eq!(split.world_size(), 2);

        let expected = values(&single.forward(&PROMPT).unwrap());
        assert_close(&expected, &values(&split.forward(&PROMPT).unwrap()), 1e-4);

        let mut cache = split.allocate_kv_cache(8).unwrap();
        let last = values(&split.forward_prefill(&PROMPT, &mut cache).unwrap());
        assert_close(&expected[4 * 32..], &last, 1e-4);
    }
}

#[test]
fn test_activation_sharding_does_not_change_results() {
    let replicated = checkpoint(&tiny_config(false), DeviceMesh::single(), false);
    let sharded = checkpoint(&tiny_config(true), DeviceMesh::single(), false);
    let mesh = DeviceMesh::new(1, 2).unwrap();
    let a = values(&load_one(&replicated, mesh).forward(&PROMPT).unwrap());
    let b = values(&load_one(&sharded, mesh).forward(&PROMPT).unwrap());
    assert_close(&a, &b, 1e-4);
}

#[test]
fn test_restore_on_a_different_mesh() {
    let config = tiny_config(false);
    let saved_on = DeviceMesh::new(1, 2).unwrap();
    let dir = checkpoint(&config, saved_on, false);
    assert_eq!(load_config(dir.path()).unwrap(), config);

    let replicas = load_sharded::<CpuBackend>(dir.path(), DeviceMesh::new(2, 1).unwrap()).unwrap();
    assert_eq!(replicas.len(), 2);
    let a = values(&replicas[0].forward(&PROMPT).unwrap());
    let b = values(&replicas[1].forward(&PROMPT).unwrap());
    assert_eq!(a, b);

    let reference = checkpoint(&config, DeviceMesh::single(), false);
    let c = values(&load_one(&reference, DeviceMesh::single()).forward(&PROMPT).unwrap());
    assert_eq!(a, c);
}

#[test]
fn test_int8_experts_stay_close() {
    let config = tiny_config(false);
    let exact = checkpoint(&config, DeviceMesh::single(), false);
    let quantized = checkpoint(&config, DeviceMesh::new(1, 2).unwrap(), true);
    let a = values(&load_one(&exact, DeviceMesh::single()).forward(&PROMPT).unwrap());
    let b = values(&load_one(&quantized, DeviceMesh::single()).forward(&PROMPT).unwrap());
    assert_close(&a, &b, 0.25);
}

#[test]
fn test_out_of_vocabulary_is_rejected() {
    let dir = checkpoint(&tiny_config(false), DeviceMesh::single(), false);
    let model = load_one(&dir, DeviceMesh::single());
    let mut cache = model.allocate_kv_cache(8).unwrap();
    let err = model.forward_prefill(&[1, 32], &mut cache).unwrap_err();
    assert!(matches!(
        err,
        Error::OutOfVocabulary {
            token: 32,
            vocab_size: 32
        }
    ));
    assert!(cache.is_empty());
    // The model is still usable afterwards.
    model.forward_prefill(&[1, 31], &mut cache).unwrap();
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_cache_overflow_is_rejected() {
    let dir = checkpoint(&tiny_config(false), DeviceMesh::single(), false);
    let model = load_one(&dir, DeviceMesh::single());
    let mut cache = model.allocate_kv_cache(4).unwrap();
    assert!(matches!(
        model.forward_prefill(&PROMPT, &mut cache),
        Err(Error::SequenceTooLong { len: 5, max: 4 })
    ));
    assert!(matches!(
        model.allocate_kv_cache(17),
        Err(Error::SequenceTooLong { .. })
    ));
}

#[test]
fn test_mesh_that_does_not_divide_heads_is_rejected() {
    let dir = checkpoint(&tiny_config(false), DeviceMesh::single(), false);
    let err = load_sharded::<CpuBackend>(dir.path(), DeviceMesh::new(1, 3).unwrap())
        .err()
        .unwrap();
    assert!(err.is_shape_mismatch());
}

#[test]
fn test_config_disagreeing_with_weights_is_rejected() {
    let dir = checkpoint(&tiny_config(false), DeviceMesh::single(), false);
    let path = dir.path().join("manifest.json");
    let mut manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    manifest["config"]["vocab_size"] = serde_json::json!(48);
    std::fs::write(&path, manifest.to_string()).unwrap();

    let err = load_sharded::<CpuBackend>(dir.path(), DeviceMesh::single())
        .err()
        .unwrap();
    assert!(err.is_shape_mismatch(), "{err}");
}
