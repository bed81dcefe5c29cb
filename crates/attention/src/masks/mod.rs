//! Multiplicative `{0, 1}` attention masks.
//!
//! Masks are `f32` tensors where `1.0` keeps a score and `0.0` discards it.
//! Attention turns them into an additive term `(1 - mask) * MASK_FILL` before
//! the softmax, so fully masked rows stay finite.

pub mod causal;
pub mod decode;

use candle_core::DType;

/// Dtype shared by all masks and the ALiBi buffer.
pub const MASK_DTYPE: DType = DType::F32;

/// Score added to masked positions.
pub const MASK_FILL: f32 = -10_000.0;

pub use causal::CausalMask;
pub use decode::position_mask;

#[cfg(test)]
mod tests;
