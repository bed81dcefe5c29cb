//! Error type for decoder construction and forward passes.

use attention::AttentionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("weight `{name}`: {reason}")]
    Weight { name: String, reason: String },
}

impl DecoderError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn weight(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Weight {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DecoderError>;
