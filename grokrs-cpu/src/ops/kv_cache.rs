//! KvCacheOps implementation for CpuBackend.

use grokrs::backend::{KvCache, KvCacheOps};
use grokrs::tensor::Tensor;
use grokrs::{Error, Result};

use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// CPU contiguous KV cache: one pre-allocated (K, V) buffer per layer and a
/// shared filled-length cursor.
#[derive(Debug)]
pub struct CpuKvCache {
    layers: Vec<CpuLayerKv>,
    num_kv_heads: usize,
    head_dim: usize,
    capacity: usize,
    len: usize,
}

#[derive(Debug)]
struct CpuLayerKv {
    k: Vec<f32>, // (capacity, num_kv_heads, head_dim) flattened
    v: Vec<f32>,
    /// Positions written past the cursor by the in-flight step.
    pending: usize,
}

impl CpuKvCache {
    #[must_use]
    pub fn new(num_layers: usize, capacity: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        let size = capacity * num_kv_heads * head_dim;
        let layers = (0..num_layers)
            .map(|_| CpuLayerKv {
                k: vec![0.0; size],
                v: vec![0.0; size],
                pending: 0,
            })
            .collect();
        Self {
            layers,
            num_kv_heads,
            head_dim,
            capacity,
            len: 0,
        }
    }

    fn stride(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    fn layer(&self, layer_idx: usize) -> Result<&CpuLayerKv> {
        self.layers
            .get(layer_idx)
            .ok_or_else(|| Error::Other(format!("kv cache has no layer {layer_idx}")))
    }
}

impl KvCache for CpuKvCache {
    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn reset(&mut self) {
        self.len = 0;
        for layer in &mut self.layers {
            layer.pending = 0;
        }
    }
}

impl KvCacheOps for CpuBackend {
    fn allocate_kv_cache(
        num_layers: usize,
        capacity: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> Result<CpuKvCache> {
        Ok(CpuKvCache::new(num_layers, capacity, num_kv_heads, head_dim))
    }

    fn append_kv(
        cache: &mut CpuKvCache,
        layer_idx: usize,
        k: &CpuTensor,
        v: &CpuTensor,
    ) -> Result<()> {
        let expected = [
            k.shape().first().copied().unwrap_or(0),
            cache.num_kv_heads,
            cache.head_dim,
        ];
        for t in [k, v] {
            if t.shape() != expected {
                return Err(Error::shape("kv append", &expected, t.shape()));
            }
        }
        let new_tokens = expected[0];
        let end = cache.len + new_tokens;
        if end > cache.capacity {
            return Err(Error::SequenceTooLong {
                len: end,
                max: cache.capacity,
            });
        }
        let stride = cache.stride();
        let start = cache.len * stride;
        let layer = cache
            .layers
            .get_mut(layer_idx)
            .ok_or_else(|| Error::Other(format!("kv cache has no layer {layer_idx}")))?;
        layer.k[start..end * stride].copy_from_slice(k.as_slice());
        layer.v[start..end * stride].copy_from_slice(v.as_slice());
        layer.pending = new_tokens;
        Ok(())
    }

    fn kv_history(
        cache: &CpuKvCache,
        layer_idx: usize,
        upto: usize,
    ) -> Result<(CpuTensor, CpuTensor)> {
        let layer = cache.layer(layer_idx)?;
        if upto > cache.len + layer.pending {
            return Err(Error::Other(format!(
                "kv history up to {upto} requested but only {} positions written",
                cache.len + layer.pending
            )));
        }
        let n = upto * cache.stride();
        let shape = [upto, cache.num_kv_heads, cache.head_dim];
        Ok((
            CpuTensor::from_f32(&shape, &layer.k[..n])?,
            CpuTensor::from_f32(&shape, &layer.v[..n])?,
        ))
    }

    fn advance(cache: &mut CpuKvCache, n: usize) -> Result<()> {
        let end = cache.len + n;
        if end > cache.capacity {
            return Err(Error::SequenceTooLong {
                len: end,
                max: cache.capacity,
            });
        }
        if cache.layers.iter().any(|l| l.pending != n) {
            return Err(Error::Other(format!(
                "kv advance by {n} before every layer appended"
            )));
        }
        cache.len = end;
        for layer in &mut cache.layers {
            layer.pending = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(n: usize, fill: f32) -> CpuTensor {
        CpuTensor::from_f32(&[n, 1, 2], &vec![fill; n * 2]).unwrap()
    }

    #[test]
    fn test_append_advance_history() {
        let mut cache = CpuBackend::allocate_kv_cache(2, 4, 1, 2).unwrap();
        for layer in 0..2 {
            CpuBackend::append_kv(&mut cache, layer, &kv(3, 1.0), &kv(3, 2.0)).unwrap();
        }
        // Current step's keys are visible before the cursor moves.
        let (k, _) = CpuBackend::kv_history(&cache, 0, 3).unwrap();
        assert_eq!(k.shape(), &[3, 1, 2]);
        CpuBackend::advance(&mut cache, 3).unwrap();
        assert_eq!(cache.len(), 3);

        for layer in 0..2 {
            CpuBackend::append_kv(&mut cache, layer, &kv(1, 5.0), &kv(1, 6.0)).unwrap();
        }
        CpuBackend::advance(&mut cache, 1).unwrap();
        let (k, v) = CpuBackend::kv_history(&cache, 1, 4).unwrap();
        assert_eq!(&k.as_slice()[6..], &[5.0, 5.0]);
        assert_eq!(&v.as_slice()[..2], &[2.0, 2.0]);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_overflow_is_rejected() {
        let mut cache = CpuBackend::allocate_kv_cache(1, 2, 1, 2).unwrap();
        let err = CpuBackend::append_kv(&mut cache, 0, &kv(3, 0.0), &kv(3, 0.0)).unwrap_err();
        assert!(matches!(err, Error::SequenceTooLong { len: 3, max: 2 }));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_advance_requires_every_layer() {
        let mut cache = CpuBackend::allocate_kv_cache(2, 4, 1, 2).unwrap();
        CpuBackend::append_kv(&mut cache, 0, &kv(1, 0.0), &kv(1, 0.0)).unwrap();
        assert!(CpuBackend::advance(&mut cache, 1).is_err());
    }

    #[test]
    fn test_reset() {
        let mut cache = CpuBackend::allocate_kv_cache(1, 2, 1, 2).unwrap();
        CpuBackend::append_kv(&mut cache, 0, &kv(2, 0.0), &kv(2, 0.0)).unwrap();
        CpuBackend::advance(&mut cache, 2).unwrap();
        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 2);
    }
}
