//! Rotary position embeddings.
//!
//! Feature pairs `(x[2i], x[2i+1])` of every query/key head are rotated by
//! `pos * theta^(-2i/d)`. Tables are built once in `f32` and the rotation is
//! evaluated in `f32` before casting back to the input dtype.

use candle_core::{DType, Device, Tensor};

use crate::core::errors::{AttentionError, Result};

#[derive(Debug, Clone)]
pub struct RotaryTables {
    head_dim: usize,
    max_len: usize,
    /// `(max_len, head_dim / 2)`
    cos: Tensor,
    sin: Tensor,
}

impl RotaryTables {
    pub fn new(head_dim: usize, max_len: usize, theta: f64, device: &Device) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(AttentionError::config(format!(
                "rotary head_dim must be even and non-zero, got {head_dim}"
            )));
        }
        let half = head_dim / 2;
        let inv_freqs: Vec<f64> = (0..half)
            .map(|i| theta.powf(-((2 * i) as f64) / head_dim as f64))
            .collect();
        let mut cos = Vec::with_capacity(max_len * half);
        let mut sin = Vec::with_capacity(max_len * half);
        for pos in 0..max_len {
            for &freq in &inv_freqs {
                let angle = pos as f64 * freq;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }
        Ok(Self {
            head_dim,
            max_len,
            cos: Tensor::from_vec(cos, (max_len, half), device)?,
            sin: Tensor::from_vec(sin, (max_len, half), device)?,
        })
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Rotates `x` (`[batch, heads, seq, head_dim]`) where batch row `b`
    /// starts at absolute position `offsets[b]`.
    pub fn apply(&self, x: &Tensor, offsets: &[usize]) -> Result<Tensor> {
        let (batch, heads, seq, dim) = x.dims4()?;
        if dim != self.head_dim {
            return Err(AttentionError::shape(format!(
                "rotary expects head_dim {}, got {dim}",
                self.head_dim
            )));
        }
        if offsets.len() != batch {
            return Err(AttentionError::shape(format!(
                "rotary got {} offsets for batch {batch}",
                offsets.len()
            )));
        }
        let half = dim / 2;

        let mut cos_rows = Vec::with_capacity(batch);
        let mut sin_rows = Vec::with_capacity(batch);
        for &offset in offsets {
            if offset + seq > self.max_len {
                return Err(AttentionError::CacheOverflow {
                    position: offset + seq,
                    capacity: self.max_len,
                });
            }
            cos_rows.push(self.cos.narrow(0, offset, seq)?);
            sin_rows.push(self.sin.narrow(0, offset, seq)?);
        }
        let cos = Tensor::stack(&cos_rows, 0)?
            .unsqueeze(1)?
            .broadcast_as((batch, heads, seq, half))?;
        let sin = Tensor::stack(&sin_rows, 0)?
            .unsqueeze(1)?
            .broadcast_as((batch, heads, seq, half))?;

        let dtype = x.dtype();
        let pairs = x
            .to_dtype(DType::F32)?
            .reshape((batch, heads, seq, half, 2))?;
        let even = pairs.narrow(4, 0, 1)?.squeeze(4)?;
        let odd = pairs.narrow(4, 1, 1)?.squeeze(4)?;

        let rot_even = even.mul(&cos)?.sub(&odd.mul(&sin)?)?;
        let rot_odd = odd.mul(&cos)?.add(&even.mul(&sin)?)?;
        Ok(Tensor::stack(&[rot_even, rot_odd], 4)?
            .reshape((batch, heads, seq, dim))?
            .to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arange(shape: (usize, usize, usize, usize)) -> Result<Tensor> {
        let total = shape.0 * shape.1 * shape.2 * shape.3;
        let data: Vec<f32> = (0..total).map(|v| v as f32 * 0.1).collect();
        Ok(Tensor::from_vec(data, shape, &Device::Cpu)?)
    }

    #[test]
    fn position_zero_is_identity() -> Result<()> {
        let tables = RotaryTables::new(4, 8, 10_000.0, &Device::Cpu)?;
        let x = arange((1, 2, 1, 4))?;
        let out = tables.apply(&x, &[0])?;
        assert_eq!(out.flatten_all()?.to_vec1::<f32>()?, x.flatten_all()?.to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn rotation_preserves_pair_norms() -> Result<()> {
        let tables = RotaryTables::new(8, 16, 10_000.0, &Device::Cpu)?;
        let x = arange((2, 2, 3, 8))?;
        let out = tables.apply(&x, &[0, 5])?;
        let norm = |t: &Tensor| -> Result<Vec<f32>> {
            Ok(t.sqr()?.sum_keepdim(3)?.flatten_all()?.to_vec1::<f32>()?)
        };
        for (a, b) in norm(&x)?.iter().zip(norm(&out)?) {
            assert!((a - b).abs() < 1e-3);
        }
        Ok(())
    }

    #[test]
    fn offset_matches_slice_of_longer_sequence() -> Result<()> {
        let tables = RotaryTables::new(4, 8, 10_000.0, &Device::Cpu)?;
        let x = arange((1, 1, 4, 4))?;
        let full = tables.apply(&x, &[0])?;
        let tail = tables.apply(&x.narrow(2, 2, 2)?, &[2])?;
        let expected = full.narrow(2, 2, 2)?;
        let diff = tail.sub(&expected)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn odd_head_dim_is_rejected() {
        assert!(RotaryTables::new(3, 4, 10_000.0, &Device::Cpu).is_err());
    }
}
