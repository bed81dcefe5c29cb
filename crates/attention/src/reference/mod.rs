//! Portable attention math.
//!
//! These paths favour clarity over absolute performance and are the single
//! implementation used by the decoder.

pub mod exact;

pub use exact::{
    build_attention, scaled_dot_product, AlibiAttention, Attention, ExactAttention, PositionIds,
    RotaryAttention,
};
