//! Configuration shared by all attention strategies.
//!
//! [`AttentionConfig`] is immutable once a layer is built. Dtypes are carried
//! as [`Precision`] so the struct round-trips through serde; call
//! [`Precision::to_dtype`] to obtain the candle dtype.

use candle_core::DType;
use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, Result};

/// Serde-friendly floating point precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F16,
    Bf16,
    F32,
}

impl Precision {
    pub fn to_dtype(self) -> DType {
        match self {
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
            Precision::F32 => DType::F32,
        }
    }

    pub fn from_dtype(dtype: DType) -> Result<Self> {
        match dtype {
            DType::F16 => Ok(Precision::F16),
            DType::BF16 => Ok(Precision::Bf16),
            DType::F32 => Ok(Precision::F32),
            other => Err(AttentionError::UnsupportedDType {
                requested: format!("{other:?}"),
            }),
        }
    }

    /// Parses `f16`, `fp16`, `bf16`, `f32`, `fp32` (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "f16" | "fp16" | "float16" => Some(Precision::F16),
            "bf16" | "bfloat16" => Some(Precision::Bf16),
            "f32" | "fp32" | "float32" => Some(Precision::F32),
            _ => None,
        }
    }
}

/// How decode positions are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionMode {
    /// The caller supplies `batch_valid_length` for every decode step.
    #[default]
    Explicit,
    /// Positions are counted from non-zero cache slots (legacy behaviour).
    Inferred,
}

impl PositionMode {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "explicit" => Some(PositionMode::Explicit),
            "inferred" | "occupancy" => Some(PositionMode::Inferred),
            _ => None,
        }
    }
}

/// Positional strategy applied inside attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionalKind {
    None,
    #[default]
    Alibi,
    Rotary,
}

/// Immutable attention configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub batch_size: usize,
    /// Global head count, before model-parallel sharding.
    pub num_heads: usize,
    pub head_dim: usize,
    pub max_source_length: usize,
    pub max_target_length: usize,
    pub compute_dtype: Precision,
    pub softmax_dtype: Precision,
    pub use_incremental_decode: bool,
    #[serde(default)]
    pub position_mode: PositionMode,
    #[serde(default)]
    pub positional: PositionalKind,
}

impl AttentionConfig {
    pub fn new(batch_size: usize, num_heads: usize, head_dim: usize, max_length: usize) -> Self {
        Self {
            batch_size,
            num_heads,
            head_dim,
            max_source_length: max_length,
            max_target_length: max_length,
            compute_dtype: Precision::F32,
            softmax_dtype: Precision::F32,
            use_incremental_decode: true,
            position_mode: PositionMode::Explicit,
            positional: PositionalKind::Alibi,
        }
    }

    /// Number of key/value slots the cache must hold.
    pub fn max_length(&self) -> usize {
        self.max_source_length.max(self.max_target_length)
    }

    pub fn hidden_size(&self) -> usize {
        self.num_heads * self.head_dim
    }

    pub fn scale(&self) -> f64 {
        1.0 / (self.head_dim as f64).sqrt()
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(AttentionError::config("batch_size must be > 0"));
        }
        if self.num_heads == 0 {
            return Err(AttentionError::config("num_heads must be > 0"));
        }
        if self.head_dim == 0 {
            return Err(AttentionError::config("head_dim must be > 0"));
        }
        if self.max_length() == 0 {
            return Err(AttentionError::config("max sequence length must be > 0"));
        }
        if self.positional == PositionalKind::Rotary && self.head_dim % 2 != 0 {
            return Err(AttentionError::config(format!(
                "rotary embeddings need an even head_dim, got {}",
                self.head_dim
            )));
        }
        Ok(())
    }
}
