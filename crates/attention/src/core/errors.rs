//! Error types emitted by attention components.

use thiserror::Error;

use crate::kv_cache::CacheState;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// A dimension does not divide evenly across the requested shard grid.
    #[error("dimension {dim} of extent {extent} is not divisible by shard factor {factor}")]
    ShardMismatch {
        dim: usize,
        extent: usize,
        factor: usize,
    },
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    ShapeMismatch { context: String },
    #[error("decode step requires a primed cache")]
    CacheNotPrimed,
    /// Prefill was attempted on a cache that already holds a prompt.
    #[error("cache is {state:?}; reset it before priming a new prompt")]
    CacheDirty { state: CacheState },
    /// A decode step targeted a slot that already holds a valid token.
    #[error("cache slot {slot} of row {row} is already occupied")]
    SlotOccupied { row: usize, slot: usize },
    #[error("cache position {position} exceeds capacity {capacity}")]
    CacheOverflow { position: usize, capacity: usize },
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    #[error("invalid attention config: {context}")]
    InvalidConfig { context: String },
    /// A collective operation across model-parallel ranks failed.
    #[error("collective failed: {message}")]
    Collective { message: String },
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub fn shape(context: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
        }
    }

    pub fn config(context: impl Into<String>) -> Self {
        Self::InvalidConfig {
            context: context.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AttentionError>;
