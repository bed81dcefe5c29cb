//! Normalisation layers for decoder blocks.
//!
//! Inputs follow the `(batch, seq, hidden)` convention and are normalised along
//! the last axis. Mean and variance are computed in
//! [`PrecisionPolicy::reduction`]; Bloom keeps its layernorms in `f32` even when
//! the rest of the block runs in `f16`, and the affine step happens in the same
//! dtype before casting back to storage.

use candle_core::{DType, Error, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    /// Mean-centred LayerNorm with `gamma`/`beta`.
    LayerNorm,
    /// Root-mean-square norm with a scale only.
    RmsNorm,
}

impl NormKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "layernorm" | "layer_norm" => Some(Self::LayerNorm),
            "rmsnorm" | "rms_norm" => Some(Self::RmsNorm),
            _ => None,
        }
    }
}

/// Configuration shared by all normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    pub hidden_size: usize,
    /// Stabiliser added to the variance before the square root.
    pub epsilon: f64,
    pub kind: NormKind,
}

impl NormConfig {
    pub fn new(hidden_size: usize, kind: NormKind) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
            kind,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

/// Shared interface for normalisation layers used inside decoder blocks.
pub trait NormalizationLayer: Send + Sync + std::fmt::Debug {
    fn config(&self) -> &NormConfig;

    /// Applies the normalisation to a hidden state tensor.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

fn check_param(name: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    checks::expect_shape(name, tensor, &[hidden])?;
    checks::expect_dtype_in(name, tensor, checks::FLOAT_DTYPES)?;
    checks::expect_contiguous(name, tensor)
}

fn normalize(
    config: &NormConfig,
    hidden: &Tensor,
    policy: &PrecisionPolicy,
    center: bool,
) -> Result<Tensor> {
    checks::expect_batch_seq_hidden("norm.input", hidden, config.hidden_size)?;
    let width = config.hidden_size as f64;
    let mut x = policy.cast_for_reduction(hidden)?;
    if center {
        let mean = (x.sum_keepdim(D::Minus1)? / width)?;
        x = x.broadcast_sub(&mean)?;
    }
    let variance = (x.sqr()?.sum_keepdim(D::Minus1)? / width)?;
    let denom = (variance + config.epsilon)?.sqrt()?;
    x.broadcast_div(&denom)
}

fn affine(x: Tensor, param: &Tensor, dtype: DType, add: bool) -> Result<Tensor> {
    let param = param.to_dtype(dtype)?;
    if add {
        x.broadcast_add(&param)
    } else {
        x.broadcast_mul(&param)
    }
}

/// LayerNorm with learnable `gamma` (scale) and `beta` (shift).
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    gamma: Tensor,
    beta: Tensor,
}

impl LayerNorm {
    pub fn new(gamma: Tensor, beta: Tensor, mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::LayerNorm;
        check_param("layernorm.gamma", &gamma, config.hidden_size)?;
        check_param("layernorm.beta", &beta, config.hidden_size)?;
        Ok(Self {
            config,
            gamma,
            beta,
        })
    }
}

impl NormalizationLayer for LayerNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let x = normalize(&self.config, hidden, policy, true)?;
        let dtype = x.dtype();
        let x = affine(x, &self.gamma, dtype, false)?;
        let x = affine(x, &self.beta, dtype, true)?;
        policy.cast_to_storage(&x)
    }
}

/// RMSNorm with a learnable scale. A bias is rejected at construction.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    config: NormConfig,
    weight: Tensor,
}

impl RmsNorm {
    pub fn new(weight: Tensor, mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::RmsNorm;
        check_param("rmsnorm.weight", &weight, config.hidden_size)?;
        Ok(Self { config, weight })
    }

    /// Builds an RMSNorm from layernorm-shaped parameters; `beta` must be all zeros.
    pub fn from_layernorm_params(gamma: Tensor, beta: &Tensor, config: NormConfig) -> Result<Self> {
        let nonzero = beta
            .to_dtype(DType::F32)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        if nonzero != 0.0 {
            return Err(Error::Msg("rmsnorm does not support a bias term".into()));
        }
        Self::new(gamma, config)
    }
}

impl NormalizationLayer for RmsNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let x = normalize(&self.config, hidden, policy, false)?;
        let dtype = x.dtype();
        let x = affine(x, &self.weight, dtype, false)?;
        policy.cast_to_storage(&x)
    }
}
