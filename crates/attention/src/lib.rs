//! Bloom-style self-attention for autoregressive decoding.
//!
//! The crate covers the attention math (scaled dot-product with an ALiBi or
//! rotary positional strategy), causal and decode masks, a per-layer
//! key/value cache with an explicit `Empty -> Primed -> Extended` protocol,
//! and the shard layouts plus collectives used to split heads across
//! model-parallel ranks.
//!
//! Attention tensors use `[batch, heads, seq, head_dim]`. Masks are `{0, 1}`
//! `f32` tensors converted to an additive `(1 - mask) * MASK_FILL` term right
//! before the softmax.

pub mod core;
pub mod kv_cache;
pub mod masks;
pub mod positional;
pub mod reference;

pub use crate::core::{
    AttentionConfig, AttentionError, Collective, ExecutionContext, InProcessGroup, LocalCollective,
    ParallelConfig, Partition, PositionMode, PositionalKind, Precision, Result, ShardLayout,
    ShardSpec,
};
pub use kv_cache::{CacheLayout, CacheSnapshot, CacheState, KvCache, SlotPosition};
pub use masks::{position_mask, CausalMask, MASK_DTYPE, MASK_FILL};
pub use positional::{AlibiBias, RotaryTables};
pub use reference::{build_attention, Attention, PositionIds};
