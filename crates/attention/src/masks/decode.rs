//! Masks for single-token decode steps.

use candle_core::{Device, Tensor};

use super::MASK_DTYPE;
use crate::core::errors::{AttentionError, Result};

/// `(batch, 1, 1, k_len)` mask with `1` for every slot `j <= positions[b]`.
///
/// The decode path intersects this with the cache's slot validity so that
/// padded prompt slots stay excluded.
pub fn position_mask(device: &Device, positions: &[usize], k_len: usize) -> Result<Tensor> {
    let batch = positions.len();
    let mut data = vec![0f32; batch * k_len];
    for (b, &pos) in positions.iter().enumerate() {
        if pos >= k_len {
            return Err(AttentionError::CacheOverflow {
                position: pos,
                capacity: k_len,
            });
        }
        for j in 0..=pos {
            data[b * k_len + j] = 1.0;
        }
    }
    Ok(Tensor::from_vec(data, (batch, 1, 1, k_len), device)?.to_dtype(MASK_DTYPE)?)
}
