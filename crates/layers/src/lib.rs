//! Building blocks for transformer decoder layers.
//!
//! Every component consumes hidden states shaped `(batch, seq, hidden)` and
//! returns the same layout. Dtype handling is centralised in
//! [`dtypes::PrecisionPolicy`]: parameters may live in `f16`/`bf16` while
//! matmuls and reductions are promoted as the policy dictates.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;

pub use activations::{Activation, ActivationKind};
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit, LinearLayer};
pub use mlp::{FeedForward, FeedForwardConfig, FeedForwardLayer};
pub use norm::{LayerNorm, NormConfig, NormKind, NormalizationLayer, RmsNorm};
pub use residual::{Residual, ResidualConfig};
