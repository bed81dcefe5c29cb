//! Self-attention sublayer of a decoder block.
//!
//! Queries, keys and values come from column-parallel projections that keep
//! `num_heads / mp` heads per rank. The merged heads go through a
//! row-parallel output projection whose partial sums are all-reduced before
//! the output bias is added once.

use std::ops::Range;
use std::sync::{Arc, Once};

use attention::{
    build_attention, position_mask, Attention, AttentionConfig, AttentionError, CacheSnapshot,
    ExecutionContext, KvCache, PositionIds, PositionMode, ShardLayout, ShardSpec, SlotPosition,
};
use candle_core::Tensor;
use layers::{Linear, LinearLayer, PrecisionPolicy};
use log::warn;

use crate::config::ModelConfig;
use crate::error::{DecoderError, Result};
use crate::step::LayerStep;
use crate::weights::{BlockWeightNames, WeightSource};

static INFERRED_MODE_WARNING: Once = Once::new();

#[derive(Debug, Clone)]
pub struct SelfAttention {
    config: AttentionConfig,
    hidden_size: usize,
    heads: Range<usize>,
    query: Linear,
    key: Linear,
    value: Linear,
    projection: Linear,
    projection_bias: Tensor,
    strategy: Arc<dyn Attention>,
    ctx: ExecutionContext,
    policy: PrecisionPolicy,
}

impl SelfAttention {
    pub fn new(
        model: &ModelConfig,
        layer: usize,
        ctx: &ExecutionContext,
        weights: &dyn WeightSource,
    ) -> Result<Self> {
        let config = model.attention_config();
        let hidden = model.hidden_size;
        let head_dim = model.head_dim();
        let names = BlockWeightNames::new(layer);
        let dtype = model.param_dtype.to_dtype();
        let device = &ctx.device;

        let columns = ShardLayout::new(ctx.parallel, ShardSpec::hidden_states()).local_range(
            &[model.batch_size, 1, hidden],
            2,
            ctx.mp_rank,
        )?;
        let heads = columns.start / head_dim..columns.end / head_dim;

        let fetch = |suffix: &str, shape: &[usize]| {
            weights.fetch(&names.name(&format!("attention.{suffix}")), shape, dtype, device)
        };
        let column = |dense: &str| -> Result<Linear> {
            let weight = fetch(&format!("{dense}.weight"), &[hidden, hidden])?;
            let bias = fetch(&format!("{dense}.bias"), &[hidden])?;
            Ok(Linear::column_shard(&weight, Some(&bias), columns.clone())?)
        };
        let query = column("dense1")?;
        let key = column("dense2")?;
        let value = column("dense3")?;

        let projection = Linear::row_shard(
            &fetch("projection.weight", &[hidden, hidden])?,
            columns,
        )?;
        let projection_bias = fetch("projection.bias", &[hidden])?;

        let layout = ShardLayout::new(ctx.parallel, ShardSpec::attention_heads());
        let strategy: Arc<dyn Attention> =
            Arc::from(build_attention(&config, layout, heads.clone(), device)?);

        if config.position_mode == PositionMode::Inferred {
            INFERRED_MODE_WARNING.call_once(|| {
                warn!(
                    "decode positions are inferred from non-zero cache slots; \
                     a real key whose first feature is exactly zero will be miscounted"
                );
            });
        }

        Ok(Self {
            config,
            hidden_size: hidden,
            heads,
            query,
            key,
            value,
            projection,
            projection_bias,
            strategy,
            ctx: ctx.clone(),
            policy: model.precision_policy(),
        })
    }

    /// Global head indices owned by this rank.
    pub fn heads(&self) -> Range<usize> {
        self.heads.clone()
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub(crate) fn forward(
        &self,
        hidden: &Tensor,
        step: &LayerStep<'_>,
        cache: &mut KvCache,
    ) -> Result<(Tensor, Option<CacheSnapshot>)> {
        let (batch, seq, width) = match hidden.dims() {
            &[batch, seq, width] => (batch, seq, width),
            dims => {
                return Err(AttentionError::shape(format!(
                    "attention input must be [batch, seq, hidden], got {dims:?}"
                ))
                .into())
            }
        };
        if width != self.hidden_size {
            return Err(AttentionError::shape(format!(
                "attention input width {width} != hidden size {}",
                self.hidden_size
            ))
            .into());
        }

        let q = self.split_heads(&self.query.forward(hidden, &self.policy)?)?;
        let k = self.split_heads(&self.key.forward(hidden, &self.policy)?)?;
        let v = self.split_heads(&self.value.forward(hidden, &self.policy)?)?;

        let (context, snapshot) = match *step {
            LayerStep::Prefill { validity, mask } => {
                let positions = PositionIds::prefill(batch, seq);
                let (q, k) = self.strategy.encode_positions(&q, &k, &positions)?;
                let snapshot = if self.config.use_incremental_decode {
                    cache.prime_with_validity(&k, &v, validity)?;
                    Some(cache.snapshot())
                } else {
                    None
                };
                let bias = self.strategy.score_bias(&positions, seq)?;
                let mask = mask.unsqueeze(1)?;
                let context = self.strategy.attend(&q, &k, &v, bias.as_ref(), Some(&mask))?;
                (context, snapshot)
            }
            LayerStep::Decode { batch_valid_length } => {
                if !self.config.use_incremental_decode {
                    return Err(
                        AttentionError::config("decode step requires incremental decoding").into(),
                    );
                }
                if seq != 1 {
                    return Err(AttentionError::shape(format!(
                        "decode step expects one token per row, got {seq}"
                    ))
                    .into());
                }
                let requested = match (self.config.position_mode, batch_valid_length) {
                    (PositionMode::Explicit, Some(lengths)) => {
                        SlotPosition::ValidLength(lengths.to_vec())
                    }
                    (PositionMode::Explicit, None) => {
                        return Err(DecoderError::config(
                            "batch_valid_length is required in explicit position mode",
                        ))
                    }
                    (PositionMode::Inferred, _) => SlotPosition::Inferred,
                };
                let slots = cache.resolve_positions(&requested)?;
                let positions = PositionIds::decode(&slots);
                let (q, k) = self.strategy.encode_positions(&q, &k, &positions)?;
                cache.extend(&k, &v, &SlotPosition::Explicit(slots.clone()))?;

                let capacity = cache.layout().max_seq_len;
                let validity = cache.validity().unsqueeze(1)?.unsqueeze(1)?;
                let mask =
                    position_mask(&self.ctx.device, &slots, capacity)?.broadcast_mul(&validity)?;
                let bias = self.strategy.score_bias(&positions, capacity)?;
                let context = self.strategy.attend(
                    &q,
                    cache.keys(),
                    cache.values(),
                    bias.as_ref(),
                    Some(&mask),
                )?;
                (context, Some(cache.snapshot()))
            }
        };

        let merged = self.merge_heads(&context)?;
        let partial = self.projection.forward(&merged, &self.policy)?;
        let reduced = self.ctx.collective.all_reduce_sum(&partial)?;
        let bias = self.projection_bias.to_dtype(reduced.dtype())?;
        let output = reduced.broadcast_add(&bias)?;
        Ok((self.policy.cast_to_storage(&output)?, snapshot))
    }

    /// `[batch, seq, local_hidden]` -> `[batch, local_heads, seq, head_dim]`.
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;
        let local_heads = self.heads.end - self.heads.start;
        Ok(x
            .reshape((batch, seq, local_heads, self.config.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn merge_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq, head_dim) = x.dims4()?;
        Ok(x.transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, heads * head_dim))?)
    }
}
