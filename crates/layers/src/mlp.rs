//! Position-wise feed-forward sublayer.
//!
//! `hidden -> mapping (hidden -> ffn) -> activation -> projection (ffn -> hidden)`.
//! Under model parallelism `up` is a column shard holding `ffn / mp` output
//! features and `down` is the matching row shard. The row shard carries no
//! bias, so the caller sums partial outputs across ranks and then adds the
//! projection bias exactly once.

use std::sync::Arc;

use candle_core::{Error, Result, Tensor};

use crate::{
    activations::{builtin, Activation, ActivationKind},
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearLayer},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    /// Width of the activation space held by this shard.
    pub intermediate_size: usize,
    pub activation: ActivationKind,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation,
        }
    }
}

/// Shared interface for feed-forward stacks.
pub trait FeedForwardLayer: Send + Sync {
    fn config(&self) -> &FeedForwardConfig;

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

#[derive(Debug, Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    up: Linear,
    down: Linear,
    activation: Arc<dyn Activation>,
}

impl FeedForward {
    pub fn new(config: FeedForwardConfig, up: Linear, down: Linear) -> Result<Self> {
        let up_cfg = up.config();
        let down_cfg = down.config();
        if up_cfg.input_dim != config.hidden_size || up_cfg.output_dim != config.intermediate_size {
            return Err(Error::Msg(format!(
                "ffn.mapping: expected {}->{}, got {}->{}",
                config.hidden_size, config.intermediate_size, up_cfg.input_dim, up_cfg.output_dim
            )));
        }
        if down_cfg.input_dim != config.intermediate_size
            || down_cfg.output_dim != config.hidden_size
        {
            return Err(Error::Msg(format!(
                "ffn.projection: expected {}->{}, got {}->{}",
                config.intermediate_size,
                config.hidden_size,
                down_cfg.input_dim,
                down_cfg.output_dim
            )));
        }
        let activation = builtin(config.activation);
        Ok(Self {
            config,
            up,
            down,
            activation,
        })
    }
}

impl FeedForwardLayer for FeedForward {
    fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("ffn.input", hidden, self.config.hidden_size)?;
        let mapped = self.up.forward(hidden, policy)?;
        let activated = self.activation.forward(&mapped, policy)?;
        self.down.forward(&activated, policy)
    }
}
