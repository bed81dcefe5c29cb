//! Linear and affine projection helpers.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` and return tensors
//! with `(batch, seq, out_dim)`. Weights follow the `(out_dim, in_dim)`
//! convention so that model-parallel slicing is a `narrow` along dim 0
//! (column-parallel, output features split) or dim 1 (row-parallel, input
//! features split). Weights and activations are cast to
//! [`PrecisionPolicy::compute`] for the matmul and the result is returned in
//! [`PrecisionPolicy::storage`].

use std::ops::Range;

use candle_core::{DType, Device, Error, Result, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a bias vector is applied inside [`LinearLayer::forward`].
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a single projection layer with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    /// Same geometry without a bias term.
    pub fn without_bias(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: false,
        }
    }
}

/// Shared interface for affine projections.
pub trait LinearLayer: Send + Sync {
    /// Returns the static configuration used to validate inputs.
    fn config(&self) -> &LinearConfig;

    /// Applies the linear projection, promoting to the compute dtype when needed.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Deterministic weight initialisation policies.
#[derive(Debug, Clone, PartialEq)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Uniform samples in `[-bound, bound]`.
    Uniform { bound: f32 },
    /// Every element set to the same value.
    Constant(f32),
}

impl LinearInit {
    /// Samples a `(out_dim, in_dim)` matrix from a seeded generator.
    ///
    /// The same `(seed, shape)` pair always yields bit-identical weights.
    pub fn sample(
        &self,
        shape: (usize, usize),
        seed: u64,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let total = out_dim * in_dim;
        let data: Vec<f32> = match self {
            LinearInit::Constant(value) => vec![*value; total],
            LinearInit::XavierUniform | LinearInit::Uniform { .. } => {
                let bound = match self {
                    LinearInit::Uniform { bound } => *bound,
                    _ => (6.0f32 / (in_dim + out_dim) as f32).sqrt(),
                };
                let mut rng = StdRng::seed_from_u64(seed);
                (0..total).map(|_| rng.gen_range(-bound..=bound)).collect()
            }
        };
        Tensor::from_vec(data, shape, device)?.to_dtype(dtype)
    }
}

/// Dense affine projection with optional bias and mixed-precision aware forward pass.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with seeded weights and a zero bias.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.output_dim, config.input_dim), seed, dtype, device)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Column-parallel shard: keeps output features `rows` of `weight`/`bias`.
    pub fn column_shard(weight: &Tensor, bias: Option<&Tensor>, rows: Range<usize>) -> Result<Self> {
        let (_, in_dim) = weight.dims2()?;
        let len = rows.end - rows.start;
        let weight = weight.narrow(0, rows.start, len)?.contiguous()?;
        let bias = bias
            .map(|b| b.narrow(0, rows.start, len).and_then(|b| b.contiguous()))
            .transpose()?;
        let config = LinearConfig {
            input_dim: in_dim,
            output_dim: len,
            bias: bias.is_some(),
        };
        Self::new(config, weight, bias)
    }

    /// Row-parallel shard: keeps input features `cols` of `weight`.
    ///
    /// The bias is never part of a row-parallel shard; it must be added once
    /// after the partial outputs have been summed across ranks.
    pub fn row_shard(weight: &Tensor, cols: Range<usize>) -> Result<Self> {
        let (out_dim, _) = weight.dims2()?;
        let len = cols.end - cols.start;
        let weight = weight.narrow(1, cols.start, len)?.contiguous()?;
        Self::new(LinearConfig::without_bias(len, out_dim), weight, None)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, checks::FLOAT_DTYPES)?;
        checks::expect_contiguous("linear.weight", weight)
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in("linear.bias", tensor, checks::FLOAT_DTYPES)?;
                checks::expect_contiguous("linear.bias", tensor)
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let (batch, seq) = match hidden.dims() {
            [b, s, h] if *h == self.config.input_dim => (*b, *s),
            dims => {
                return Err(Error::Msg(format!(
                    "linear expects input shaped (batch, seq, {}), got {dims:?}",
                    self.config.input_dim
                )))
            }
        };

        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;
        let flat = input.reshape((batch * seq, self.config.input_dim))?;
        let mut output = flat
            .matmul(&weight_t)?
            .reshape((batch, seq, self.config.output_dim))?;

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_matmul(bias)?)?;
        }

        policy.cast_to_storage(&output)
    }
}
