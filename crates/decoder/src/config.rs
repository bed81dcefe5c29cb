//! Model configuration.
//!
//! [`ModelConfig`] is loaded from TOML or JSON, optionally adjusted from the
//! environment, and validated as a whole so that every problem is reported at
//! once.

use std::fs;
use std::path::Path;

use attention::{
    AttentionConfig, ParallelConfig, PositionMode, PositionalKind, Precision,
};
use layers::{ActivationKind, NormKind, PrecisionPolicy};
use serde::{Deserialize, Serialize};

use crate::error::{DecoderError, Result};

/// Overrides the decode position mode (`explicit` or `inferred`).
pub const ENV_POSITION_MODE: &str = "DECODER_POSITION_MODE";
/// Overrides the softmax dtype (`f16`, `bf16`, `f32`).
pub const ENV_SOFTMAX_DTYPE: &str = "DECODER_SOFTMAX_DTYPE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub ffn_hidden_size: usize,
    /// Prompt length and number of cache slots.
    pub max_seq_length: usize,
    pub batch_size: usize,
    #[serde(default)]
    pub positional: PositionalKind,
    #[serde(default)]
    pub position_mode: PositionMode,
    #[serde(default = "default_half")]
    pub compute_dtype: Precision,
    #[serde(default = "default_full")]
    pub softmax_dtype: Precision,
    #[serde(default = "default_full")]
    pub layernorm_dtype: Precision,
    #[serde(default = "default_full")]
    pub param_dtype: Precision,
    #[serde(default)]
    pub post_layernorm_residual: bool,
    #[serde(default = "default_act")]
    pub hidden_act: String,
    #[serde(default = "default_norm")]
    pub norm: String,
    #[serde(default = "default_eps")]
    pub layernorm_epsilon: f64,
    #[serde(default = "default_true")]
    pub use_past: bool,
    /// Seed for [`SeededInit::from_config`](crate::SeededInit::from_config).
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub parallel: ParallelConfig,
}

fn default_half() -> Precision {
    Precision::F16
}

fn default_full() -> Precision {
    Precision::F32
}

fn default_act() -> String {
    "gelu".to_string()
}

fn default_norm() -> String {
    "layernorm".to_string()
}

fn default_eps() -> f64 {
    1e-5
}

fn default_true() -> bool {
    true
}

impl ModelConfig {
    /// A small all-`f32` configuration with Bloom's defaults elsewhere.
    pub fn new(
        hidden_size: usize,
        num_layers: usize,
        num_heads: usize,
        max_seq_length: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            hidden_size,
            num_layers,
            num_heads,
            ffn_hidden_size: 4 * hidden_size,
            max_seq_length,
            batch_size,
            positional: PositionalKind::Alibi,
            position_mode: PositionMode::Explicit,
            compute_dtype: Precision::F32,
            softmax_dtype: Precision::F32,
            layernorm_dtype: Precision::F32,
            param_dtype: Precision::F32,
            post_layernorm_residual: false,
            hidden_act: default_act(),
            norm: default_norm(),
            layernorm_epsilon: default_eps(),
            use_past: true,
            seed: 0,
            parallel: ParallelConfig::default(),
        }
    }

    /// Reads a config file (`.toml`, `.json`, or no extension for TOML),
    /// applies environment overrides and validates the result.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: ModelConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(DecoderError::config(format!(
                    "unsupported configuration extension '{other}'"
                )))
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: ModelConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|err| DecoderError::config(err.to_string()))
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(ENV_POSITION_MODE) {
            self.position_mode = PositionMode::parse(&raw).ok_or_else(|| {
                DecoderError::config(format!("{ENV_POSITION_MODE}: unknown mode '{raw}'"))
            })?;
        }
        if let Some(raw) = lookup(ENV_SOFTMAX_DTYPE) {
            self.softmax_dtype = Precision::parse(&raw).ok_or_else(|| {
                DecoderError::config(format!("{ENV_SOFTMAX_DTYPE}: unknown dtype '{raw}'"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        for (name, value) in [
            ("hidden_size", self.hidden_size),
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
            ("ffn_hidden_size", self.ffn_hidden_size),
            ("max_seq_length", self.max_seq_length),
            ("batch_size", self.batch_size),
            ("parallel.data_parallel", self.parallel.data_parallel),
            ("parallel.model_parallel", self.parallel.model_parallel),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        }

        if self.num_heads > 0 && self.hidden_size % self.num_heads != 0 {
            errors.push(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            ));
        }
        let mp = self.parallel.model_parallel;
        if mp > 0 {
            if self.num_heads % mp != 0 {
                errors.push(format!(
                    "num_heads ({}) must be divisible by parallel.model_parallel ({mp})",
                    self.num_heads
                ));
            }
            if self.ffn_hidden_size % mp != 0 {
                errors.push(format!(
                    "ffn_hidden_size ({}) must be divisible by parallel.model_parallel ({mp})",
                    self.ffn_hidden_size
                ));
            }
        }
        let dp = self.parallel.data_parallel;
        if dp > 0 && self.batch_size % dp != 0 {
            errors.push(format!(
                "batch_size ({}) must be divisible by parallel.data_parallel ({dp})",
                self.batch_size
            ));
        }
        if self.positional == PositionalKind::Rotary && self.head_dim() % 2 != 0 {
            errors.push(format!(
                "rotary embeddings need an even head dim, got {}",
                self.head_dim()
            ));
        }
        if ActivationKind::from_name(&self.hidden_act).is_none() {
            errors.push(format!("hidden_act '{}' is not supported", self.hidden_act));
        }
        if NormKind::from_name(&self.norm).is_none() {
            errors.push(format!("norm '{}' is not supported", self.norm));
        }
        if self.layernorm_epsilon.is_nan() || self.layernorm_epsilon <= 0.0 {
            errors.push("layernorm_epsilon must be positive".to_string());
        }
        if self.position_mode == PositionMode::Inferred && !self.use_past {
            errors.push("position_mode 'inferred' requires use_past".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DecoderError::Validation(errors))
        }
    }

    pub fn head_dim(&self) -> usize {
        if self.num_heads == 0 {
            0
        } else {
            self.hidden_size / self.num_heads
        }
    }

    pub fn activation(&self) -> ActivationKind {
        ActivationKind::from_name(&self.hidden_act).unwrap_or(ActivationKind::Gelu)
    }

    pub fn norm_kind(&self) -> NormKind {
        NormKind::from_name(&self.norm).unwrap_or(NormKind::LayerNorm)
    }

    /// Hidden states travel in the compute dtype; norms reduce in the
    /// layernorm dtype.
    pub fn precision_policy(&self) -> PrecisionPolicy {
        PrecisionPolicy::uniform(self.compute_dtype.to_dtype(), self.layernorm_dtype.to_dtype())
    }

    /// Global (unsharded) attention settings for every layer.
    pub fn attention_config(&self) -> AttentionConfig {
        AttentionConfig {
            batch_size: self.batch_size,
            num_heads: self.num_heads,
            head_dim: self.head_dim(),
            max_source_length: self.max_seq_length,
            max_target_length: self.max_seq_length,
            compute_dtype: self.compute_dtype,
            softmax_dtype: self.softmax_dtype,
            use_incremental_decode: self.use_past,
            position_mode: self.position_mode,
            positional: self.positional,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn toml_defaults_follow_bloom() {
        let cfg = ModelConfig::from_toml_str(
            r#"
            hidden_size = 64
            num_layers = 2
            num_heads = 8
            ffn_hidden_size = 256
            max_seq_length = 32
            batch_size = 1
            "#,
        )
        .unwrap();
        assert_eq!(cfg.compute_dtype, Precision::F16);
        assert_eq!(cfg.softmax_dtype, Precision::F32);
        assert_eq!(cfg.positional, PositionalKind::Alibi);
        assert_eq!(cfg.position_mode, PositionMode::Explicit);
        assert_eq!(cfg.head_dim(), 8);
        assert_eq!(cfg.activation(), ActivationKind::Gelu);
        assert!(cfg.use_past);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut cfg = ModelConfig::new(10, 0, 3, 8, 3);
        cfg.parallel = ParallelConfig {
            data_parallel: 2,
            model_parallel: 2,
        };
        cfg.hidden_act = "tanh".into();
        let err = cfg.validate().unwrap_err();
        match err {
            DecoderError::Validation(messages) => {
                assert!(messages.iter().any(|m| m.contains("num_layers")));
                assert!(messages.iter().any(|m| m.contains("divisible by num_heads")));
                assert!(messages.iter().any(|m| m.contains("model_parallel")));
                assert!(messages.iter().any(|m| m.contains("data_parallel")));
                assert!(messages.iter().any(|m| m.contains("hidden_act")));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn overrides_replace_mode_and_softmax_dtype() {
        let mut cfg = ModelConfig::new(8, 1, 2, 4, 1);
        let env: HashMap<&str, &str> = [
            (ENV_POSITION_MODE, "inferred"),
            (ENV_SOFTMAX_DTYPE, "fp16"),
        ]
        .into_iter()
        .collect();
        cfg.apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.position_mode, PositionMode::Inferred);
        assert_eq!(cfg.softmax_dtype, Precision::F16);

        let bad = |key: &str| (key == ENV_SOFTMAX_DTYPE).then(|| "f8".to_string());
        assert!(matches!(
            cfg.apply_overrides(bad),
            Err(DecoderError::Config(_))
        ));
    }

    #[test]
    fn attention_config_carries_geometry() {
        let cfg = ModelConfig::new(16, 1, 4, 12, 2);
        let attn = cfg.attention_config();
        assert_eq!(attn.head_dim, 4);
        assert_eq!(attn.max_length(), 12);
        assert!(attn.use_incremental_decode);
    }
}
