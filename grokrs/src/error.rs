//! Error types for grokrs

use thiserror::Error;

/// Result type alias using grokrs' Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for grokrs operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    ConfigInvalid(String),

    #[error("Shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Shape mismatch: axis of length {len} is not divisible into {shards} shards (axis {axis})")]
    UnevenShard {
        axis: usize,
        len: usize,
        shards: usize,
    },

    #[error("Invalid partition spec: {0}")]
    InvalidPartition(String),

    #[error("Token {token} is out of vocabulary (vocab size {vocab_size})")]
    OutOfVocabulary { token: u32, vocab_size: usize },

    #[error("Sequence of length {len} exceeds maximum of {max}")]
    SequenceTooLong { len: usize, max: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    #[error("Weight not found: {0}")]
    WeightNotFound(String),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Collective error: {0}")]
    Comm(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error belongs to the shape-mismatch class: a tensor
    /// disagrees with its config, or a shard count does not divide an axis.
    #[must_use]
    pub fn is_shape_mismatch(&self) -> bool {
        matches!(self, Self::ShapeMismatch { .. } | Self::UnevenShard { .. })
    }

    /// Build a [`Error::ShapeMismatch`].
    pub fn shape(name: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            name: name.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Self::SafeTensors(e.to_string())
    }
}
