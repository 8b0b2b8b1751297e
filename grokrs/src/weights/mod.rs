//! Weight storage: host tensors, safetensors access, int8 quantization and
//! the sharded checkpoint format.

pub mod checkpoint;
pub mod host;
pub mod quantize;
pub mod safetensors;

pub use checkpoint::{
    CheckpointManifest, CheckpointReader, CheckpointWriter, ExpectedTensor, ShardedWeights,
    TensorRecord, WeightShard,
};
pub use host::{host_transpose_2d, HostTensor};
pub use quantize::{dequantize_int8, quantize_int8, QuantizedWeight};
