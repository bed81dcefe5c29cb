//! Residual connections for decoder sublayers.
//!
//! The add happens in [`PrecisionPolicy::compute`]; the result is cast back to
//! storage.

use candle_core::{Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct ResidualConfig {
    /// Normalise the sublayer input (pre-LN) instead of the residual stream.
    pub prenorm: bool,
}

impl ResidualConfig {
    pub fn new(prenorm: bool) -> Self {
        Self { prenorm }
    }
}

#[derive(Debug, Clone)]
pub struct Residual {
    config: ResidualConfig,
}

impl Residual {
    pub fn new(config: ResidualConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResidualConfig {
        &self.config
    }

    /// Returns `residual + branch`.
    pub fn forward(
        &self,
        branch: &Tensor,
        residual: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        checks::expect_rank("residual.branch", branch, 3)?;
        checks::expect_shape("residual.branch", branch, residual.dims())?;
        let branch = policy.cast_for_matmul(branch)?;
        let sum = policy.cast_for_matmul(residual)?.add(&branch)?;
        policy.cast_to_storage(&sum)
    }
}
