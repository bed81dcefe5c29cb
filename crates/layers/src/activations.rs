//! Element-wise non-linearities for the feed-forward sublayer.
//!
//! Inputs are promoted to [`PrecisionPolicy::compute`] before the activation
//! is evaluated and the result is cast back to the storage dtype.
//!
//! Bloom uses the tanh approximation of GeLU,
//! `0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 x^3)))`, which is what
//! [`ActivationKind::Gelu`] evaluates. The exact erf form is available as
//! [`ActivationKind::GeluErf`].

use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Identity,
    /// GeLU, tanh approximation.
    Gelu,
    /// GeLU, exact erf formulation.
    GeluErf,
    Silu,
    Relu,
}

impl ActivationKind {
    /// Parses the activation names accepted in model configs.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "identity" | "linear" => Some(Self::Identity),
            "gelu" | "fast_gelu" | "gelu_tanh" => Some(Self::Gelu),
            "gelu_erf" | "gelu_exact" => Some(Self::GeluErf),
            "silu" | "swish" => Some(Self::Silu),
            "relu" => Some(Self::Relu),
            _ => None,
        }
    }
}

/// Common interface shared by feed-forward activation functions.
pub trait Activation: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> ActivationKind;

    /// Applies the activation to `input` using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

#[derive(Debug)]
struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        if self.kind == ActivationKind::Identity {
            return policy.cast_to_storage(input);
        }
        let compute = policy.cast_for_matmul(input)?;
        let activated = match self.kind {
            ActivationKind::Gelu => compute.gelu()?,
            ActivationKind::GeluErf => compute.gelu_erf()?,
            ActivationKind::Silu => compute.silu()?,
            ActivationKind::Relu => compute.relu()?,
            ActivationKind::Identity => compute,
        };
        policy.cast_to_storage(&activated)
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}
