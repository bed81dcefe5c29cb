//! Bloom-style decoder stack.
//!
//! A [`DecoderStack`] owns `num_layers` [`DecoderBlock`]s, each with its own
//! [`attention::KvCache`]. Generation is a prefill over the padded prompt
//! followed by one-token decode steps:
//!
//! ```no_run
//! use attention::ExecutionContext;
//! use candle_core::{DType, Device, Tensor};
//! use decoder::{DecoderStack, ModelConfig, SeededInit};
//!
//! # fn main() -> decoder::Result<()> {
//! let config = ModelConfig::new(16, 2, 4, 8, 1);
//! let ctx = ExecutionContext::single(Device::Cpu);
//! let weights = SeededInit::from_config(&config);
//! let mut stack = DecoderStack::new(config, ctx, &weights)?;
//!
//! let prompt = Tensor::randn(0f32, 1.0, (1, 8, 16), &Device::Cpu)?;
//! let mask = Tensor::from_slice(&[1f32, 1., 1., 0., 0., 0., 0., 0.], (1, 8), &Device::Cpu)?;
//! stack.prefill(&prompt, &mask)?;
//!
//! let token = Tensor::randn(0f32, 1.0, (1, 1, 16), &Device::Cpu)?;
//! let out = stack.decode(&token, Some(&[3]))?;
//! assert_eq!(out.hidden.dims(), &[1, 1, 16]);
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod config;
pub mod error;
pub mod self_attention;
pub mod stack;
pub mod step;
pub mod weights;

pub use block::DecoderBlock;
pub use config::{ModelConfig, ENV_POSITION_MODE, ENV_SOFTMAX_DTYPE};
pub use error::{DecoderError, Result};
pub use self_attention::SelfAttention;
pub use stack::{DecoderStack, StackOutput};
pub use step::Step;
pub use weights::{BlockWeightNames, SeededInit, TensorMap, WeightSource};
