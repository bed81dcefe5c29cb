//! Positional information injected into attention.
//!
//! ALiBi adds a per-head linear distance penalty to the scores; rotary
//! embeddings rotate query/key feature pairs by absolute position.

pub mod alibi;
pub mod rotary;

pub use alibi::{compute_alibi_slopes, AlibiBias};
pub use rotary::RotaryTables;
