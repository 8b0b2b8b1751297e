//! Backend trait and op trait definitions for hardware-agnostic inference.
//!
//! Models are generic over `B: Backend`, and use op traits like `ArithOps`,
//! `MatmulOps`, etc. to express their compute requirements. Each backend
//! implements these traits with its own tensor type.
//!
//! - **Op traits extend `Backend`**: they use `Self::Tensor` from the
//!   supertrait, avoiding repetition.
//! - **Weights are dense f32 `[in, out]` matrices.** Storage dtypes and
//!   quantization are resolved by the checkpoint loader.
//! - **Collectives live on [`Comm`]**, one handle per model-axis rank, so a
//!   model replica only talks to its own group.

use crate::logits::Logits;
use crate::tensor::Tensor;
use crate::weights::HostTensor;
use crate::Result;

// ---- Core backend trait ----

/// A compute backend.
pub trait Backend: 'static + Send + Sync {
    /// The tensor type for this backend.
    type Tensor: Tensor + Clone + Send + Sync;

    /// Per-layer key/value history for one sequence.
    type KvCache: KvCache;

    /// Backend-specific logits type returned by forward passes.
    type Logits: Logits;

    /// Collective communicator for one rank of a model-axis group.
    type Comm: Comm<Self::Tensor>;
}

/// Fixed-capacity key/value store with a filled-length cursor.
pub trait KvCache: Send {
    /// Number of positions filled.
    fn len(&self) -> usize;

    /// Maximum number of positions.
    fn capacity(&self) -> usize;

    /// Forget every position; the allocation is kept.
    fn reset(&mut self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collectives across the model-axis shards of one computation.
///
/// Every rank of a group must call the same collectives in the same order.
pub trait Comm<T>: Send + Sync {
    /// This rank's position in the group.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn world_size(&self) -> usize;

    /// Sum `tensor` element-wise across ranks; every rank gets the total.
    ///
    /// # Errors
    /// Returns an error if shapes disagree across ranks.
    fn all_reduce_sum(&self, tensor: &mut T) -> Result<()>;

    /// Concatenate every rank's `tensor` along the last dimension, in rank order.
    ///
    /// # Errors
    /// Returns an error if leading shapes disagree across ranks.
    fn all_gather_last_dim(&self, tensor: &T) -> Result<T>;

    /// Sum across ranks, keeping only this rank's slice of the last dimension.
    ///
    /// # Errors
    /// Returns an error if the last dimension does not split evenly.
    fn reduce_scatter_last_dim(&self, tensor: &T) -> Result<T>;
}

// ---- Op traits ----

/// Core tensor arithmetic.
pub trait ArithOps: Backend {
    /// Element-wise addition, returning a new tensor.
    fn add(a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;

    /// Element-wise in-place addition: `a += b`.
    fn add_inplace(a: &mut Self::Tensor, b: &Self::Tensor) -> Result<()>;

    /// Element-wise multiplication, returning a new tensor.
    fn mul(a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;

    /// In-place scalar scaling: `a *= scale`.
    fn scale_inplace(a: &mut Self::Tensor, scale: f32) -> Result<()>;
}

/// Matrix multiplication.
pub trait MatmulOps: Backend {
    /// `(m, k) @ (k, n) -> (m, n)`; leading dims of `a` are flattened into `m`.
    fn matmul(a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;
}

/// Normalization operations.
pub trait NormOps: Backend {
    /// RMS normalization over the last dimension, returning a new tensor.
    fn rms_norm(input: &Self::Tensor, weight: &Self::Tensor, eps: f32) -> Result<Self::Tensor>;
}

/// GELU-gated activation.
pub trait GegluOps: Backend {
    /// `gelu(gate) * up` with the tanh approximation of GELU.
    fn geglu(gate: &Self::Tensor, up: &Self::Tensor) -> Result<Self::Tensor>;
}

/// Rotary position embedding.
pub trait RopeOps: Backend {
    /// Rotate `(seq, heads, head_dim)` input; row `s` uses table position
    /// `position_offset + s`. Tables are `(max_seq, head_dim / 2)`.
    fn apply_rope(
        input: &Self::Tensor,
        cos_cache: &Self::Tensor,
        sin_cache: &Self::Tensor,
        position_offset: usize,
    ) -> Result<Self::Tensor>;
}

/// Embedding table lookup.
pub trait EmbedOps: Backend {
    /// Rows of `table` for each id: `(ids.len(), table.last_dim())`.
    ///
    /// Ids must already be validated against the table size.
    fn embedding_gather(table: &Self::Tensor, ids: &[u32]) -> Result<Self::Tensor>;
}

/// Causal grouped-query attention.
pub trait AttentionOps: Backend {
    /// Attention of `q (seq, heads, d)` over `k, v (kv_len, kv_heads, d)`.
    ///
    /// Query row `s` sits at absolute position `position_offset + s` and may
    /// attend only to key positions `<= position_offset + s`. Query head `h`
    /// reads key/value head `h / (heads / kv_heads)`. Logits are multiplied by
    /// `scale` and, when `softcap` is set, squashed to `c * tanh(x / c)`.
    fn causal_attention(
        q: &Self::Tensor,
        k: &Self::Tensor,
        v: &Self::Tensor,
        position_offset: usize,
        scale: f32,
        softcap: Option<f32>,
    ) -> Result<Self::Tensor>;
}

/// Key/value cache management.
pub trait KvCacheOps: Backend {
    /// Allocate `capacity` positions for every layer.
    fn allocate_kv_cache(
        num_layers: usize,
        capacity: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> Result<Self::KvCache>;

    /// Write `k, v (n, kv_heads, d)` for `layer` at positions `len..len + n`.
    /// The cursor does not move until [`Self::advance`].
    fn append_kv(
        cache: &mut Self::KvCache,
        layer: usize,
        k: &Self::Tensor,
        v: &Self::Tensor,
    ) -> Result<()>;

    /// Keys and values of `layer` for positions `0..upto`.
    fn kv_history(
        cache: &Self::KvCache,
        layer: usize,
        upto: usize,
    ) -> Result<(Self::Tensor, Self::Tensor)>;

    /// Move the cursor forward by `n` after every layer has appended.
    fn advance(cache: &mut Self::KvCache, n: usize) -> Result<()>;
}

/// Row movement for sparse expert dispatch.
pub trait MoeOps: Backend {
    /// Copy the given rows of a `(rows, d)` tensor into a new `(rows.len(), d)` tensor.
    fn gather_rows(input: &Self::Tensor, rows: &[usize]) -> Result<Self::Tensor>;

    /// `out[rows[i]] += weights[i] * src[i]` for every `i`.
    fn scatter_add_rows(
        out: &mut Self::Tensor,
        rows: &[usize],
        src: &Self::Tensor,
        weights: &[f32],
    ) -> Result<()>;
}

/// Tensor slicing.
pub trait TensorOps: Backend {
    /// Columns `start..start + len` of the last dimension.
    fn slice_last_dim(input: &Self::Tensor, start: usize, len: usize) -> Result<Self::Tensor>;

    /// The final row of a `(rows, d)` tensor as `(1, d)`.
    fn last_row(input: &Self::Tensor) -> Result<Self::Tensor>;
}

/// Moving data between host and backend.
pub trait TensorFactory: Backend {
    /// Build a tensor from host f32 data.
    fn from_f32_slice(shape: &[usize], data: &[f32]) -> Result<Self::Tensor>;

    /// Upload a host tensor.
    fn from_host(tensor: &HostTensor) -> Result<Self::Tensor> {
        Self::from_f32_slice(&tensor.shape, &tensor.data)
    }

    /// Zero-filled tensor.
    fn zeros(shape: &[usize]) -> Result<Self::Tensor>;

    /// Copy a tensor back to host f32 data.
    fn to_f32_vec(tensor: &Self::Tensor) -> Result<Vec<f32>>;

    /// Wrap a `(rows, vocab)` tensor as logits.
    fn into_logits(tensor: Self::Tensor) -> Result<Self::Logits>;
}

/// Creation of collective groups.
pub trait MultiDeviceOps: Backend {
    /// One connected communicator per rank of a `world_size` group.
    fn comm_group(world_size: usize) -> Result<Vec<Self::Comm>>;
}
