//! Configuration, errors, shard layouts and the execution context shared by
//! every attention component.
//!
//! Attention tensors use the layout `[batch, heads, seq, head_dim]`; hidden
//! states use `(batch, seq, hidden)`.

pub mod config;
pub mod errors;
pub mod parallel;
pub mod sharding;

pub use config::{AttentionConfig, PositionMode, PositionalKind, Precision};
pub use errors::{AttentionError, Result};
pub use parallel::{Collective, ExecutionContext, InProcessGroup, LocalCollective};
pub use sharding::{ParallelConfig, Partition, ShardLayout, ShardSpec};
