//! Geometry of a per-layer key/value cache.
//!
//! Keys and values share the layout `[batch, heads, max_seq_len, head_dim]`,
//! where `heads` is the number of heads held by this model-parallel shard.

use crate::core::errors::{AttentionError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub batch: usize,
    /// Heads stored in this shard of the cache.
    pub num_heads: usize,
    /// Number of slots; decode positions must stay below this.
    pub max_seq_len: usize,
    pub head_dim: usize,
}

impl CacheLayout {
    pub fn new(batch: usize, num_heads: usize, max_seq_len: usize, head_dim: usize) -> Result<Self> {
        let layout = Self {
            batch,
            num_heads,
            max_seq_len,
            head_dim,
        };
        if [batch, num_heads, max_seq_len, head_dim].contains(&0) {
            return Err(AttentionError::config(format!(
                "cache layout dimensions must be non-zero, got {layout:?}"
            )));
        }
        Ok(layout)
    }

    /// Shape of the key and value buffers.
    pub fn buffer_shape(&self) -> (usize, usize, usize, usize) {
        (self.batch, self.num_heads, self.max_seq_len, self.head_dim)
    }

    /// Expected shape of a `seq`-token key or value block.
    pub fn block_shape(&self, seq: usize) -> [usize; 4] {
        [self.batch, self.num_heads, seq, self.head_dim]
    }
}
