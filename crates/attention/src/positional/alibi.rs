//! ALiBi (attention with linear biases).
//!
//! For head `h`, query position `i` and key position `j`:
//!
//! ```text
//! bias[h, i, j] = slope(h) * (j - i)   if j <= i
//!               = MASK_FILL            otherwise
//! ```
//!
//! The full `(heads, max_len, max_len)` buffer is computed once at
//! construction. Prefill reads the leading block; decode reads the row of the
//! current position for every batch element.

use std::ops::Range;

use candle_core::{Device, Tensor};

use crate::core::errors::{AttentionError, Result};
use crate::masks::{MASK_DTYPE, MASK_FILL};

/// Per-head slopes from "Train Short, Test Long" (Press et al.).
///
/// Power-of-two head counts get the geometric sequence `2^(-8 (h+1) / n)`.
/// Other counts take the sequence for the closest lower power of two and
/// append odd powers of the base for twice that count.
pub fn compute_alibi_slopes(num_heads: usize) -> Vec<f32> {
    if num_heads == 0 {
        return Vec::new();
    }
    let closest = 1usize << (usize::BITS - 1 - num_heads.leading_zeros());
    let base_for = |n: usize| 2.0_f64.powf(-8.0 / n as f64);

    let base = base_for(closest);
    let mut slopes: Vec<f32> = (1..=closest).map(|i| base.powi(i as i32) as f32).collect();

    if closest != num_heads {
        let extra_base = base_for(2 * closest);
        let remaining = (num_heads - closest).min(closest);
        slopes.extend((0..remaining).map(|i| extra_base.powi(1 + 2 * i as i32) as f32));
    }
    slopes
}

#[derive(Debug, Clone)]
pub struct AlibiBias {
    slopes: Vec<f32>,
    max_len: usize,
    /// `(heads, max_len, max_len)` in [`MASK_DTYPE`].
    buffer: Tensor,
}

impl AlibiBias {
    pub fn new(num_heads: usize, max_len: usize, device: &Device) -> Result<Self> {
        Self::new_partial(num_heads, 0..num_heads, max_len, device)
    }

    /// Bias for the heads in `heads` out of `total_heads`, as held by one
    /// model-parallel shard.
    pub fn new_partial(
        total_heads: usize,
        heads: Range<usize>,
        max_len: usize,
        device: &Device,
    ) -> Result<Self> {
        if total_heads == 0 {
            return Err(AttentionError::config("alibi needs at least one head"));
        }
        if heads.start >= heads.end || heads.end > total_heads {
            return Err(AttentionError::config(format!(
                "head range {heads:?} invalid for {total_heads} heads"
            )));
        }
        if max_len == 0 {
            return Err(AttentionError::config("alibi sequence length must be > 0"));
        }

        let slopes = compute_alibi_slopes(total_heads)[heads].to_vec();
        let mut data = Vec::with_capacity(slopes.len() * max_len * max_len);
        for &slope in &slopes {
            for i in 0..max_len {
                for j in 0..max_len {
                    data.push(if j <= i {
                        slope * (j as f32 - i as f32)
                    } else {
                        MASK_FILL
                    });
                }
            }
        }
        let buffer = Tensor::from_vec(data, (slopes.len(), max_len, max_len), device)?
            .to_dtype(MASK_DTYPE)?;
        Ok(Self {
            slopes,
            max_len,
            buffer,
        })
    }

    pub fn slopes(&self) -> &[f32] {
        &self.slopes
    }

    pub fn num_heads(&self) -> usize {
        self.slopes.len()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// The full `(heads, max_len, max_len)` buffer.
    pub fn buffer(&self) -> &Tensor {
        &self.buffer
    }

    /// Leading `(heads, seq, seq)` block used on prefill.
    pub fn prefill(&self, seq: usize) -> Result<Tensor> {
        self.check_len(seq, seq)?;
        Ok(self.buffer.narrow(1, 0, seq)?.narrow(2, 0, seq)?)
    }

    /// Bias rows for queries starting at `offsets[b]`, shaped
    /// `(batch, heads, q_len, k_len)`.
    pub fn rows(&self, offsets: &[usize], q_len: usize, k_len: usize) -> Result<Tensor> {
        let mut per_batch = Vec::with_capacity(offsets.len());
        for &offset in offsets {
            self.check_len(offset + q_len, k_len)?;
            per_batch.push(
                self.buffer
                    .narrow(1, offset, q_len)?
                    .narrow(2, 0, k_len)?,
            );
        }
        if per_batch.is_empty() {
            return Err(AttentionError::shape("alibi rows requested for an empty batch"));
        }
        Ok(Tensor::stack(&per_batch, 0)?)
    }

    fn check_len(&self, q_end: usize, k_len: usize) -> Result<()> {
        if q_end > self.max_len || k_len > self.max_len {
            return Err(AttentionError::CacheOverflow {
                position: q_end.max(k_len),
                capacity: self.max_len,
            });
        }
        Ok(())
    }
}
