//! Scaled dot-product attention and its positional strategies.
//!
//! All strategies share [`scaled_dot_product`]; they differ only in how
//! positional information enters: not at all ([`ExactAttention`]), as an
//! additive score bias ([`AlibiAttention`]) or as a rotation of queries and
//! keys ([`RotaryAttention`]).

use std::ops::Range;

use candle_core::{Device, Tensor};
use candle_nn::ops::softmax_last_dim;
use log::info;

use crate::core::{
    AttentionConfig, AttentionError, PositionalKind, Result, ShardLayout,
};
use crate::masks::{MASK_DTYPE, MASK_FILL};
use crate::positional::{AlibiBias, RotaryTables};

const ROTARY_THETA: f64 = 10_000.0;

/// Absolute positions of the queries in one call: batch row `b` covers
/// `offsets[b] .. offsets[b] + len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionIds {
    pub offsets: Vec<usize>,
    pub len: usize,
}

impl PositionIds {
    /// Prompt positions `0..len` for every batch row.
    pub fn prefill(batch: usize, len: usize) -> Self {
        Self {
            offsets: vec![0; batch],
            len,
        }
    }

    /// One query per batch row at the given slots.
    pub fn decode(positions: &[usize]) -> Self {
        Self {
            offsets: positions.to_vec(),
            len: 1,
        }
    }
}

/// Unified interface for attention strategies.
///
/// * `q`, `k`, `v` use `[batch, local_heads, seq, head_dim]`.
/// * `bias` is `[heads, q, k]` or `[batch|1, heads, q, k]` and is added to the
///   scores in the softmax dtype.
/// * `mask` is a `{0, 1}` tensor `[batch, 1|heads, q, k]`.
pub trait Attention: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> PositionalKind;

    /// Hook for strategies that rewrite queries/keys by position.
    fn encode_positions(
        &self,
        q: &Tensor,
        k: &Tensor,
        _positions: &PositionIds,
    ) -> Result<(Tensor, Tensor)> {
        Ok((q.clone(), k.clone()))
    }

    /// Hook for strategies that add a positional term to the scores.
    fn score_bias(&self, _positions: &PositionIds, _k_len: usize) -> Result<Option<Tensor>> {
        Ok(None)
    }

    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor>;
}

/// Computes `softmax((q k^T) / sqrt(d) + bias + (1 - mask) * MASK_FILL) v`.
///
/// The matmuls run in `config.compute_dtype`; bias, mask and softmax run in
/// `config.softmax_dtype`. The output is `[batch, heads, q, head_dim]` in the
/// compute dtype.
pub fn scaled_dot_product(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    bias: Option<&Tensor>,
    mask: Option<&Tensor>,
    config: &AttentionConfig,
    layout: &ShardLayout,
) -> Result<Tensor> {
    let (batch, heads, q_len, head_dim) = q.dims4().map_err(|_| {
        AttentionError::shape(format!("q must be [batch, heads, seq, head_dim], got {:?}", q.dims()))
    })?;
    let (kb, kh, k_len, kd) = k.dims4().map_err(|_| {
        AttentionError::shape(format!("k must be [batch, heads, seq, head_dim], got {:?}", k.dims()))
    })?;
    if (kb, kh, kd) != (batch, heads, head_dim) {
        return Err(AttentionError::shape(format!(
            "k shape {:?} does not match q shape {:?}",
            k.dims(),
            q.dims()
        )));
    }
    if v.dims() != k.dims() {
        return Err(AttentionError::shape(format!(
            "v shape {:?} does not match k shape {:?}",
            v.dims(),
            k.dims()
        )));
    }
    let local = layout.local_shape(&[config.batch_size, config.num_heads, 1, config.head_dim])?;
    if batch != local[0] || heads != local[1] || head_dim != local[3] {
        return Err(AttentionError::shape(format!(
            "q shape {:?} does not match local shard [{}, {}, _, {}]",
            q.dims(),
            local[0],
            local[1],
            local[3]
        )));
    }

    let compute = config.compute_dtype.to_dtype();
    let softmax = config.softmax_dtype.to_dtype();
    let merged = batch * heads;

    let q_view = q.to_dtype(compute)?.reshape((merged, q_len, head_dim))?;
    let k_t = k
        .to_dtype(compute)?
        .reshape((merged, k_len, head_dim))?
        .transpose(1, 2)?
        .contiguous()?;
    let scores = (q_view.matmul(&k_t)? * config.scale())?
        .reshape((batch, heads, q_len, k_len))?;
    let mut scores = scores.to_dtype(softmax)?;

    if let Some(bias) = bias {
        let bias = match bias.rank() {
            3 => bias.unsqueeze(0)?,
            4 => bias.clone(),
            _ => {
                return Err(AttentionError::shape(format!(
                    "bias must be [heads, q, k] or [batch, heads, q, k], got {:?}",
                    bias.dims()
                )))
            }
        };
        let (bb, bh, bq, bk) = bias.dims4()?;
        if (bb != 1 && bb != batch) || bh != heads || bq != q_len || bk != k_len {
            return Err(AttentionError::shape(format!(
                "bias shape {:?} incompatible with scores [{batch}, {heads}, {q_len}, {k_len}]",
                bias.dims()
            )));
        }
        scores = scores.broadcast_add(&bias.to_dtype(softmax)?)?;
    }

    if let Some(mask) = mask {
        let (mb, mh, mq, mk) = mask.dims4().map_err(|_| {
            AttentionError::shape(format!("mask must be rank 4, got {:?}", mask.dims()))
        })?;
        if mb != batch || (mh != 1 && mh != heads) || mq != q_len || mk != k_len {
            return Err(AttentionError::shape(format!(
                "mask shape {:?} incompatible with scores [{batch}, {heads}, {q_len}, {k_len}]",
                mask.dims()
            )));
        }
        let fill = MASK_FILL as f64;
        let adder = mask.to_dtype(MASK_DTYPE)?.affine(-fill, fill)?;
        scores = scores.broadcast_add(&adder.to_dtype(softmax)?)?;
    }

    let probs = softmax_last_dim(&scores.contiguous()?)?
        .to_dtype(compute)?
        .reshape((merged, q_len, k_len))?;
    let v_view = v.to_dtype(compute)?.reshape((merged, k_len, head_dim))?;
    Ok(probs
        .matmul(&v_view)?
        .reshape((batch, heads, q_len, head_dim))?)
}

/// Plain attention without positional terms.
#[derive(Debug, Clone)]
pub struct ExactAttention {
    config: AttentionConfig,
    layout: ShardLayout,
}

impl ExactAttention {
    pub fn new(config: AttentionConfig, layout: ShardLayout) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, layout })
    }
}

impl Attention for ExactAttention {
    fn kind(&self) -> PositionalKind {
        PositionalKind::None
    }

    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        scaled_dot_product(q, k, v, bias, mask, &self.config, &self.layout)
    }
}

/// Attention with the ALiBi distance bias for the heads of this shard.
#[derive(Debug, Clone)]
pub struct AlibiAttention {
    inner: ExactAttention,
    alibi: AlibiBias,
}

impl AlibiAttention {
    pub fn new(
        config: AttentionConfig,
        layout: ShardLayout,
        heads: Range<usize>,
        device: &Device,
    ) -> Result<Self> {
        let alibi = AlibiBias::new_partial(config.num_heads, heads, config.max_length(), device)?;
        Ok(Self {
            inner: ExactAttention::new(config, layout)?,
            alibi,
        })
    }

    pub fn alibi(&self) -> &AlibiBias {
        &self.alibi
    }
}

impl Attention for AlibiAttention {
    fn kind(&self) -> PositionalKind {
        PositionalKind::Alibi
    }

    fn score_bias(&self, positions: &PositionIds, k_len: usize) -> Result<Option<Tensor>> {
        self.alibi
            .rows(&positions.offsets, positions.len, k_len)
            .map(Some)
    }

    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.inner.attend(q, k, v, bias, mask)
    }
}

/// Attention with rotary position embeddings on queries and keys.
#[derive(Debug, Clone)]
pub struct RotaryAttention {
    inner: ExactAttention,
    tables: RotaryTables,
}

impl RotaryAttention {
    pub fn new(config: AttentionConfig, layout: ShardLayout, device: &Device) -> Result<Self> {
        let tables = RotaryTables::new(config.head_dim, config.max_length(), ROTARY_THETA, device)?;
        Ok(Self {
            inner: ExactAttention::new(config, layout)?,
            tables,
        })
    }
}

impl Attention for RotaryAttention {
    fn kind(&self) -> PositionalKind {
        PositionalKind::Rotary
    }

    fn encode_positions(
        &self,
        q: &Tensor,
        k: &Tensor,
        positions: &PositionIds,
    ) -> Result<(Tensor, Tensor)> {
        Ok((
            self.tables.apply(q, &positions.offsets)?,
            self.tables.apply(k, &positions.offsets)?,
        ))
    }

    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.inner.attend(q, k, v, bias, mask)
    }
}

/// Builds the strategy selected by `config.positional` for the heads in
/// `heads` of this model-parallel shard.
pub fn build_attention(
    config: &AttentionConfig,
    layout: ShardLayout,
    heads: Range<usize>,
    device: &Device,
) -> Result<Box<dyn Attention>> {
    config.validate()?;
    info!(
        "attention init positional={:?} heads={heads:?}/{} head_dim={} compute={:?} softmax={:?} parallel={:?}",
        config.positional,
        config.num_heads,
        config.head_dim,
        config.compute_dtype,
        config.softmax_dtype,
        layout.parallel()
    );
    Ok(match config.positional {
        PositionalKind::None => Box::new(ExactAttention::new(config.clone(), layout)?),
        PositionalKind::Alibi => Box::new(AlibiAttention::new(config.clone(), layout, heads, device)?),
        PositionalKind::Rotary => Box::new(RotaryAttention::new(config.clone(), layout, device)?),
    })
}
