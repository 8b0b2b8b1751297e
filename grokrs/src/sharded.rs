//! Backend-agnostic sharded model for tensor-parallel inference.
//!
//! [`ShardedModel`] wraps one replica per model-axis rank and implements
//! [`Model`](crate::Model) by running all replicas in lock-step via scoped
//! threads. Collectives happen inside each replica's forward call via the
//! backend's [`Comm`](crate::Comm); `ShardedModel` itself is only
//! responsible for thread dispatch and returning rank 0's logits.

use std::thread;

use crate::backend::{Backend, KvCache, MultiDeviceOps};
use crate::model::{validate_input, Model, ModelConfig};
use crate::shard::ShardConfig;
use crate::{Error, Result};

/// A model sharded across the model axis of a device mesh.
///
/// Input is validated once before dispatch, so a bad request never leaves
/// some ranks waiting in a collective for peers that bailed out.
pub struct ShardedModel<M: Model> {
    replicas: Vec<M>,
}

impl<M: Model> ShardedModel<M> {
    /// Wrap already-loaded replicas, ordered by rank.
    ///
    /// # Errors
    /// Returns an error if `replicas` is empty or the replicas disagree on
    /// their configuration.
    pub fn from_replicas(replicas: Vec<M>) -> Result<Self> {
        let first = replicas
            .first()
            .ok_or_else(|| Error::ConfigInvalid("sharded model needs a replica".into()))?
            .config();
        if replicas.iter().any(|r| r.config() != first) {
            return Err(Error::ConfigInvalid(
                "replicas disagree on model configuration".into(),
            ));
        }
        Ok(Self { replicas })
    }

    /// Load `world_size` replicas in parallel.
    ///
    /// The closure receives `(shard_config, communicator)` and returns one
    /// loaded replica.
    ///
    /// # Errors
    /// Returns an error if communicator setup or loading fails on any rank.
    pub fn load<F>(world_size: usize, load_shard: F) -> Result<Self>
    where
        M::B: MultiDeviceOps,
        F: Fn(ShardConfig, <M::B as Backend>::Comm) -> Result<M> + Send + Sync,
    {
        let comms = <M::B as MultiDeviceOps>::comm_group(world_size)?;

        let replicas = thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .enumerate()
                .map(|(rank, comm)| {
                    let load_shard = &load_shard;
                    s.spawn(move || load_shard(ShardConfig { rank, world_size }, comm))
                })
                .collect();
            join_all(handles)
        })?;

        Self::from_replicas(replicas)
    }

    /// Number of model-axis ranks.
    pub fn world_size(&self) -> usize {
        self.replicas.len()
    }

    /// The replicas, ordered by rank.
    pub fn replicas(&self) -> &[M] {
        &self.replicas
    }
}

// --- Per-replica KV cache wrapper ---

/// Per-replica KV cache wrapper for sharded models.
///
/// Each rank holds the keys and values of its own heads. The runner sees it
/// as an opaque single cache.
pub struct ShardedKvCache<K> {
    inner: Vec<K>,
}

impl<K: KvCache> KvCache for ShardedKvCache<K> {
    fn len(&self) -> usize {
        self.inner.first().map_or(0, KvCache::len)
    }

    fn capacity(&self) -> usize {
        self.inner.first().map_or(0, KvCache::capacity)
    }

    fn reset(&mut self) {
        self.inner.iter_mut().for_each(KvCache::reset);
    }
}

// --- Model implementation ---

impl<M: Model> Model for ShardedModel<M> {
    type B = M::B;
    type KvCache = ShardedKvCache<M::KvCache>;

    fn config(&self) -> ModelConfig {
        self.replicas[0].config()
    }

    fn allocate_kv_cache(&self, capacity: usize) -> Result<Self::KvCache> {
        let inner = self
            .replicas
            .iter()
            .map(|model| model.allocate_kv_cache(capacity))
            .collect::<Result<Vec<_>>>()?;
        Ok(ShardedKvCache { inner })
    }

    fn forward(&self, input_ids: &[u32]) -> Result<<M::B as Backend>::Logits> {
        let config = self.config();
        validate_input(input_ids, config.vocab_size, 0, config.max_seq_len)?;
        if let [model] = self.replicas.as_slice() {
            return model.forward(input_ids);
        }
        thread::scope(|s| {
            let handles: Vec<_> = self
                .replicas
                .iter()
                .map(|model| s.spawn(move || model.forward(input_ids)))
                .collect();
            collect_rank0(handles)
        })
    }

    fn forward_prefill(
        &self,
        input_ids: &[u32],
        kv_cache: &mut Self::KvCache,
    ) -> Result<<M::B as Backend>::Logits> {
        validate_input(
            input_ids,
            self.config().vocab_size,
            kv_cache.len(),
            kv_cache.capacity(),
        )?;
        if let ([model], [kv]) = (self.replicas.as_slice(), kv_cache.inner.as_mut_slice()) {
            return model.forward_prefill(input_ids, kv);
        }
        thread::scope(|s| {
            let handles: Vec<_> = self
                .replicas
                .iter()
                .zip(kv_cache.inner.iter_mut())
                .map(|(model, kv)| s.spawn(move || model.forward_prefill(input_ids, kv)))
                .collect();
            collect_rank0(handles)
        })
    }
}

fn join_all<T>(handles: Vec<thread::ScopedJoinHandle<'_, Result<T>>>) -> Result<Vec<T>> {
    handles
        .into_iter()
        .map(|h| {
            h.join()
                .map_err(|_| Error::Comm("device thread panicked".into()))?
        })
        .collect()
}

/// Collect results from parallel threads, returning rank 0's logits.
///
/// Other ranks' logits are discarded; the final all-reduce has already made
/// them identical. The first error from any rank wins.
fn collect_rank0<T>(handles: Vec<thread::ScopedJoinHandle<'_, Result<T>>>) -> Result<T> {
    join_all(handles)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Comm("no rank 0 result".into()))
}
