//! Causal masks for the prefill step.
//!
//! Given a `(batch, seq)` validity vector, [`CausalMask::forward`] returns a
//! `(batch, seq, seq)` mask with `mask[b, i, j] = 1` iff both positions are
//! valid and `j <= i`.

use candle_core::{Device, Tensor};

use super::MASK_DTYPE;
use crate::core::errors::{AttentionError, Result};

#[derive(Debug, Clone)]
pub struct CausalMask {
    seq_length: usize,
    /// `(seq_length, seq_length)` lower triangle including the diagonal.
    lower_triangle: Tensor,
}

impl CausalMask {
    pub fn new(seq_length: usize, device: &Device) -> Result<Self> {
        if seq_length == 0 {
            return Err(AttentionError::config("causal mask length must be > 0"));
        }
        let mut data = vec![0f32; seq_length * seq_length];
        for i in 0..seq_length {
            for j in 0..=i {
                data[i * seq_length + j] = 1.0;
            }
        }
        let lower_triangle =
            Tensor::from_vec(data, (seq_length, seq_length), device)?.to_dtype(MASK_DTYPE)?;
        Ok(Self {
            seq_length,
            lower_triangle,
        })
    }

    pub fn seq_length(&self) -> usize {
        self.seq_length
    }

    /// Builds the prefill mask from `input_mask` (`(batch, seq)`, non-zero =
    /// real token). Prompts shorter than `seq_length` use the leading block of
    /// the triangle.
    pub fn forward(&self, input_mask: &Tensor) -> Result<Tensor> {
        let (batch, seq) = input_mask.dims2().map_err(|_| {
            AttentionError::shape(format!(
                "causal mask input must be (batch, seq), got {:?}",
                input_mask.dims()
            ))
        })?;
        if seq > self.seq_length {
            return Err(AttentionError::shape(format!(
                "prompt length {seq} exceeds causal mask length {}",
                self.seq_length
            )));
        }
        let valid = input_mask
            .to_dtype(MASK_DTYPE)?
            .ne(0f32)?
            .to_dtype(MASK_DTYPE)?;
        let outer = valid
            .unsqueeze(2)?
            .broadcast_mul(&valid.unsqueeze(1)?)?;
        let tri = self.lower_triangle.narrow(0, 0, seq)?.narrow(1, 0, seq)?;
        let mask = outer.broadcast_mul(&tri)?;
        debug_assert_eq!(mask.dims(), &[batch, seq, seq]);
        Ok(mask)
    }
}
