//! One decoder layer: self-attention and feed-forward with residuals.
//!
//! Pre-layernorm (default):
//!
//! ```text
//! x   = h + attention(ln1(h))
//! out = x + ffn(ln2(x))
//! ```
//!
//! With `post_layernorm_residual` the attention branch reads the raw hidden
//! state instead, `x = h + attention(h)`; the feed-forward half is unchanged.

use std::sync::Arc;

use attention::{
    CacheLayout, CacheSnapshot, CacheState, ExecutionContext, KvCache, ShardLayout, ShardSpec,
};
use candle_core::Tensor;
use layers::{
    FeedForward, FeedForwardConfig, FeedForwardLayer, LayerNorm, Linear, NormConfig, NormKind,
    NormalizationLayer, PrecisionPolicy, Residual, ResidualConfig, RmsNorm,
};

use crate::self_attention::SelfAttention;
use crate::config::ModelConfig;
use crate::error::Result;
use crate::step::LayerStep;
use crate::weights::{BlockWeightNames, WeightSource};

#[derive(Debug)]
pub struct DecoderBlock {
    layer: usize,
    ln1: Arc<dyn NormalizationLayer>,
    ln2: Arc<dyn NormalizationLayer>,
    attention: SelfAttention,
    ffn: Arc<FeedForward>,
    ffn_bias: Tensor,
    residual: Residual,
    policy: PrecisionPolicy,
    ctx: ExecutionContext,
    cache: KvCache,
}

fn build_norm(
    model: &ModelConfig,
    names: &BlockWeightNames,
    which: &str,
    ctx: &ExecutionContext,
    weights: &dyn WeightSource,
) -> Result<Arc<dyn NormalizationLayer>> {
    let hidden = model.hidden_size;
    let dtype = model.layernorm_dtype.to_dtype();
    let fetch = |param: &str| {
        weights.fetch(&names.name(&format!("{which}.{param}")), &[hidden], dtype, &ctx.device)
    };
    let gamma = fetch("gamma")?;
    let beta = fetch("beta")?;
    let config = NormConfig::new(hidden, model.norm_kind()).with_epsilon(model.layernorm_epsilon);
    let norm: Arc<dyn NormalizationLayer> = match model.norm_kind() {
        NormKind::LayerNorm => Arc::new(LayerNorm::new(gamma, beta, config)?),
        NormKind::RmsNorm => Arc::new(RmsNorm::from_layernorm_params(gamma, &beta, config)?),
    };
    Ok(norm)
}

impl DecoderBlock {
    pub fn new(
        model: &ModelConfig,
        layer: usize,
        ctx: &ExecutionContext,
        weights: &dyn WeightSource,
    ) -> Result<Self> {
        let names = BlockWeightNames::new(layer);
        let hidden = model.hidden_size;
        let ffn_hidden = model.ffn_hidden_size;
        let dtype = model.param_dtype.to_dtype();
        let device = &ctx.device;

        let ln1 = build_norm(model, &names, "layernorm1", ctx, weights)?;
        let ln2 = build_norm(model, &names, "layernorm2", ctx, weights)?;
        let attention = SelfAttention::new(model, layer, ctx, weights)?;

        let columns = ShardLayout::new(ctx.parallel, ShardSpec::hidden_states()).local_range(
            &[model.batch_size, 1, ffn_hidden],
            2,
            ctx.mp_rank,
        )?;
        let fetch = |suffix: &str, shape: &[usize]| {
            weights.fetch(&names.name(&format!("output.{suffix}")), shape, dtype, device)
        };
        let mapping = Linear::column_shard(
            &fetch("mapping.weight", &[ffn_hidden, hidden])?,
            Some(&fetch("mapping.bias", &[ffn_hidden])?),
            columns.clone(),
        )?;
        let projection = Linear::row_shard(
            &fetch("projection.weight", &[hidden, ffn_hidden])?,
            columns.clone(),
        )?;
        let ffn_bias = fetch("projection.bias", &[hidden])?;
        let ffn = FeedForward::new(
            FeedForwardConfig::new(hidden, columns.len(), model.activation()),
            mapping,
            projection,
        )?;

        let heads = attention.heads();
        let layout = CacheLayout::new(
            model.batch_size / ctx.parallel.data_parallel,
            heads.len(),
            model.max_seq_length,
            model.head_dim(),
        )?;
        let cache = KvCache::new(layout, model.compute_dtype.to_dtype(), device)?;

        Ok(Self {
            layer,
            ln1,
            ln2,
            attention,
            ffn: Arc::new(ffn),
            ffn_bias,
            residual: Residual::new(ResidualConfig::new(!model.post_layernorm_residual)),
            policy: model.precision_policy(),
            ctx: ctx.clone(),
            cache,
        })
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    pub fn cache_state(&self) -> CacheState {
        self.cache.state()
    }

    pub fn reset_cache(&mut self) -> Result<()> {
        Ok(self.cache.reset()?)
    }

    /// Same weights, fresh empty cache.
    pub fn fork(&self) -> Result<Self> {
        Ok(Self {
            layer: self.layer,
            ln1: Arc::clone(&self.ln1),
            ln2: Arc::clone(&self.ln2),
            attention: self.attention.clone(),
            ffn: Arc::clone(&self.ffn),
            ffn_bias: self.ffn_bias.clone(),
            residual: self.residual.clone(),
            policy: self.policy,
            ctx: self.ctx.clone(),
            cache: self.cache.fresh_like()?,
        })
    }

    pub(crate) fn forward(
        &mut self,
        hidden: &Tensor,
        step: &LayerStep<'_>,
    ) -> Result<(Tensor, Option<CacheSnapshot>)> {
        let hidden = self.policy.cast_to_storage(hidden)?;
        let attn_input = if self.residual.config().prenorm {
            self.ln1.forward(&hidden, &self.policy)?
        } else {
            hidden.clone()
        };
        let (attn_out, snapshot) = self.attention.forward(&attn_input, step, &mut self.cache)?;
        let x = self.residual.forward(&attn_out, &hidden, &self.policy)?;

        let normed = self.ln2.forward(&x, &self.policy)?;
        let partial = self.ffn.forward(&normed, &self.policy)?;
        let reduced = self.ctx.collective.all_reduce_sum(&partial)?;
        let ffn_out = reduced.broadcast_add(&self.ffn_bias.to_dtype(reduced.dtype())?)?;
        let out = self.residual.forward(&ffn_out, &x, &self.policy)?;
        Ok((out, snapshot))
    }
}
