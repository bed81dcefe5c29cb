//! The cache state machine.

use std::cell::Cell;
use std::marker::PhantomData;

use candle_core::{DType, Device, Tensor};
use log::{debug, info};

use super::layout::CacheLayout;
use crate::core::errors::{AttentionError, Result};
use crate::masks::MASK_DTYPE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Empty,
    /// Holds a prompt; no decode step has run yet.
    Primed,
    /// At least one decode step has been written.
    Extended,
}

/// Where a decode step writes its key/value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotPosition {
    /// One slot index per batch row, supplied by the caller.
    Explicit(Vec<usize>),
    /// Number of valid tokens already cached per batch row. The slot is
    /// counted from the row's first valid slot, so left padding is skipped.
    ValidLength(Vec<usize>),
    /// One past the last valid slot of each row, read from the cache.
    Inferred,
}

/// Immutable view of the buffers after a mutation.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub keys: Tensor,
    pub values: Tensor,
    pub version: u64,
}

/// Keys, values and slot validity for one layer of one session.
///
/// All mutation goes through `&mut self`. The type is `Send` but not `Sync`,
/// so a cache can move to a worker thread but never be shared between two.
#[derive(Debug)]
pub struct KvCache {
    layout: CacheLayout,
    dtype: DType,
    device: Device,
    keys: Tensor,
    values: Tensor,
    /// `(batch, max_seq_len)`, `1.0` for slots written by prime/extend.
    validity: Tensor,
    state: CacheState,
    version: u64,
    _not_sync: PhantomData<Cell<()>>,
}

impl KvCache {
    pub fn new(layout: CacheLayout, dtype: DType, device: &Device) -> Result<Self> {
        let keys = Tensor::zeros(layout.buffer_shape(), dtype, device)?;
        let values = Tensor::zeros(layout.buffer_shape(), dtype, device)?;
        let validity = Tensor::zeros((layout.batch, layout.max_seq_len), MASK_DTYPE, device)?;
        info!(
            "kv cache allocated: batch={} heads={} slots={} head_dim={} dtype={dtype:?}",
            layout.batch, layout.num_heads, layout.max_seq_len, layout.head_dim
        );
        Ok(Self {
            layout,
            dtype,
            device: device.clone(),
            keys,
            values,
            validity,
            state: CacheState::Empty,
            version: 0,
            _not_sync: PhantomData,
        })
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn keys(&self) -> &Tensor {
        &self.keys
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn validity(&self) -> &Tensor {
        &self.validity
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            keys: self.keys.clone(),
            values: self.values.clone(),
            version: self.version,
        }
    }

    /// Fresh, empty cache with the same geometry.
    pub fn fresh_like(&self) -> Result<Self> {
        Self::new(self.layout, self.dtype, &self.device)
    }

    pub fn reset(&mut self) -> Result<()> {
        self.keys = self.keys.zeros_like()?;
        self.values = self.values.zeros_like()?;
        self.validity = self.validity.zeros_like()?;
        self.state = CacheState::Empty;
        self.bump("reset");
        Ok(())
    }

    /// Stores a prompt, inferring slot validity from non-zero key rows.
    pub fn prime(&mut self, keys: &Tensor, values: &Tensor) -> Result<u64> {
        let validity = Self::nonzero_slots(keys)?;
        self.prime_with_validity(keys, values, &validity)
    }

    /// Stores a prompt `[batch, heads, seq, head_dim]` with an explicit
    /// `(batch, seq)` validity vector. Padded slots are zeroed and the buffers
    /// are zero-filled up to `max_seq_len`.
    pub fn prime_with_validity(
        &mut self,
        keys: &Tensor,
        values: &Tensor,
        validity: &Tensor,
    ) -> Result<u64> {
        if self.state != CacheState::Empty {
            return Err(AttentionError::CacheDirty { state: self.state });
        }
        let seq = self.check_block("prime", keys, values)?;
        if validity.dims() != [self.layout.batch, seq] {
            return Err(AttentionError::shape(format!(
                "prime validity must be ({}, {seq}), got {:?}",
                self.layout.batch,
                validity.dims()
            )));
        }

        let dtype = self.dtype;
        let valid = validity.to_dtype(MASK_DTYPE)?.ne(0f32)?.to_dtype(MASK_DTYPE)?;
        let slot_mask = valid.unsqueeze(1)?.unsqueeze(3)?.to_dtype(dtype)?;
        let pad = self.layout.max_seq_len - seq;
        let store = |t: &Tensor| -> Result<Tensor> {
            let masked = t.to_dtype(dtype)?.broadcast_mul(&slot_mask)?;
            Ok(masked.pad_with_zeros(2, 0, pad)?.contiguous()?)
        };
        self.keys = store(keys)?;
        self.values = store(values)?;
        self.validity = valid.pad_with_zeros(1, 0, pad)?.contiguous()?;
        self.state = CacheState::Primed;
        self.bump("prime");
        Ok(self.version)
    }

    /// Writes one key/value `[batch, heads, 1, head_dim]` per batch row at the
    /// resolved slot. Every other slot is left untouched. A slot that already
    /// holds a valid token is never overwritten. Returns the slots written.
    pub fn extend(
        &mut self,
        key: &Tensor,
        value: &Tensor,
        position: &SlotPosition,
    ) -> Result<Vec<usize>> {
        if self.state == CacheState::Empty {
            return Err(AttentionError::CacheNotPrimed);
        }
        let seq = self.check_block("extend", key, value)?;
        if seq != 1 {
            return Err(AttentionError::shape(format!(
                "extend writes exactly one token, got {seq}"
            )));
        }
        let positions = self.resolve_positions(position)?;
        let validity = self.validity.to_vec2::<f32>()?;
        for (row, (&slot, valid)) in positions.iter().zip(&validity).enumerate() {
            if valid[slot] != 0.0 {
                return Err(AttentionError::SlotOccupied { row, slot });
            }
        }

        let slots = self.layout.max_seq_len;
        let mut onehot = vec![0f32; self.layout.batch * slots];
        for (b, &pos) in positions.iter().enumerate() {
            onehot[b * slots + pos] = 1.0;
        }
        let onehot = Tensor::from_vec(onehot, (self.layout.batch, slots), &self.device)?;
        let keep = onehot.affine(-1.0, 1.0)?;

        let dtype = self.dtype;
        let write = onehot.unsqueeze(1)?.unsqueeze(3)?.to_dtype(dtype)?;
        let retain = keep.unsqueeze(1)?.unsqueeze(3)?.to_dtype(dtype)?;
        let merge = |buffer: &Tensor, new: &Tensor| -> Result<Tensor> {
            let kept = buffer.broadcast_mul(&retain)?;
            let placed = new.to_dtype(dtype)?.broadcast_mul(&write)?;
            Ok(kept.add(&placed)?)
        };
        self.keys = merge(&self.keys, key)?;
        self.values = merge(&self.values, value)?;
        self.validity = self.validity.mul(&keep)?.add(&onehot)?;
        self.state = CacheState::Extended;
        self.bump("extend");
        debug!("kv cache extend wrote slots {positions:?}");
        Ok(positions)
    }

    /// Turns a [`SlotPosition`] into one checked slot index per batch row.
    pub fn resolve_positions(&self, position: &SlotPosition) -> Result<Vec<usize>> {
        let positions = match position {
            SlotPosition::Explicit(positions) => {
                self.check_row_count(positions)?;
                positions.clone()
            }
            SlotPosition::ValidLength(lengths) => {
                self.check_row_count(lengths)?;
                self.validity
                    .to_vec2::<f32>()?
                    .iter()
                    .zip(lengths)
                    .map(|(row, &len)| row.iter().position(|&v| v != 0.0).unwrap_or(0) + len)
                    .collect()
            }
            SlotPosition::Inferred => self.occupancy()?,
        };
        if let Some(&overflow) = positions.iter().find(|&&p| p >= self.layout.max_seq_len) {
            return Err(AttentionError::CacheOverflow {
                position: overflow,
                capacity: self.layout.max_seq_len,
            });
        }
        Ok(positions)
    }

    /// One past the last valid slot of each batch row, `0` for a row with no
    /// valid slot. Equals the token count for right-padded rows.
    pub fn occupancy(&self) -> Result<Vec<usize>> {
        Ok(self
            .validity
            .to_vec2::<f32>()?
            .iter()
            .map(|row| row.iter().rposition(|&v| v != 0.0).map_or(0, |last| last + 1))
            .collect())
    }

    fn check_row_count(&self, positions: &[usize]) -> Result<()> {
        if positions.len() != self.layout.batch {
            return Err(AttentionError::shape(format!(
                "expected {} decode positions, got {}",
                self.layout.batch,
                positions.len()
            )));
        }
        Ok(())
    }

    fn nonzero_slots(keys: &Tensor) -> Result<Tensor> {
        let (batch, _, seq, _) = keys.dims4()?;
        let probe = keys.narrow(1, 0, 1)?.narrow(3, 0, 1)?;
        Ok(probe
            .to_dtype(DType::F32)?
            .ne(0f32)?
            .to_dtype(MASK_DTYPE)?
            .reshape((batch, seq))?)
    }

    fn check_block(&self, op: &str, keys: &Tensor, values: &Tensor) -> Result<usize> {
        let dims = keys.dims();
        if dims.len() != 4 {
            return Err(AttentionError::shape(format!(
                "{op} keys must be rank 4, got {dims:?}"
            )));
        }
        let seq = dims[2];
        let expected = self.layout.block_shape(seq);
        if dims != expected || values.dims() != expected {
            return Err(AttentionError::shape(format!(
                "{op} expects keys/values {expected:?}, got {dims:?} / {:?}",
                values.dims()
            )));
        }
        if seq == 0 {
            return Err(AttentionError::shape(format!("{op} got an empty block")));
        }
        if seq > self.layout.max_seq_len {
            return Err(AttentionError::CacheOverflow {
                position: seq,
                capacity: self.layout.max_seq_len,
            });
        }
        Ok(seq)
    }

    fn bump(&mut self, op: &str) {
        self.version += 1;
        debug!(
            "kv cache {op}: state={:?} version={}",
            self.state, self.version
        );
    }
}
