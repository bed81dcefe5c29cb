//! A stack of decoder blocks sharing one causal mask and execution context.

use attention::{CacheSnapshot, CacheState, CausalMask, ExecutionContext, MASK_DTYPE};
use candle_core::Tensor;
use log::{debug, info};

use crate::block::DecoderBlock;
use crate::config::ModelConfig;
use crate::error::{DecoderError, Result};
use crate::step::{LayerStep, Step};
use crate::weights::WeightSource;

/// Final hidden state plus every layer's cache after the call.
#[derive(Debug, Clone)]
pub struct StackOutput {
    pub hidden: Tensor,
    /// One entry per layer when incremental decoding is enabled.
    pub presents: Vec<CacheSnapshot>,
}

#[derive(Debug)]
pub struct DecoderStack {
    config: ModelConfig,
    blocks: Vec<DecoderBlock>,
    causal: CausalMask,
    ctx: ExecutionContext,
}

impl DecoderStack {
    pub fn new(
        config: ModelConfig,
        ctx: ExecutionContext,
        weights: &dyn WeightSource,
    ) -> Result<Self> {
        config.validate()?;
        if ctx.parallel != config.parallel {
            return Err(DecoderError::config(format!(
                "execution context grid {:?} does not match configured grid {:?}",
                ctx.parallel, config.parallel
            )));
        }
        let blocks = (0..config.num_layers)
            .map(|layer| DecoderBlock::new(&config, layer, &ctx, weights))
            .collect::<Result<Vec<_>>>()?;
        let causal = CausalMask::new(config.max_seq_length, &ctx.device)?;
        info!(
            "decoder stack ready: layers={} hidden={} heads={} ffn={} max_seq={} rank=(dp {}, mp {}) of {:?}",
            config.num_layers,
            config.hidden_size,
            config.num_heads,
            config.ffn_hidden_size,
            config.max_seq_length,
            ctx.dp_rank,
            ctx.mp_rank,
            ctx.parallel
        );
        Ok(Self {
            config,
            blocks,
            causal,
            ctx,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[DecoderBlock] {
        &self.blocks
    }

    pub fn cache_state(&self, layer: usize) -> Option<CacheState> {
        self.blocks.get(layer).map(DecoderBlock::cache_state)
    }

    /// Runs every block in order. The first failing block aborts the call.
    pub fn forward(&mut self, hidden: &Tensor, step: &Step) -> Result<StackOutput> {
        match step {
            Step::Prefill { input_mask } => {
                let validity = input_mask.to_dtype(MASK_DTYPE)?.ne(0f32)?.to_dtype(MASK_DTYPE)?;
                let mask = self.causal.forward(&validity)?;
                debug!("prefill over {:?}", hidden.dims());
                self.run(
                    hidden,
                    &LayerStep::Prefill {
                        validity: &validity,
                        mask: &mask,
                    },
                )
            }
            Step::Decode { batch_valid_length } => {
                debug!("decode step at {batch_valid_length:?}");
                self.run(
                    hidden,
                    &LayerStep::Decode {
                        batch_valid_length: batch_valid_length.as_deref(),
                    },
                )
            }
        }
    }

    pub fn prefill(&mut self, hidden: &Tensor, input_mask: &Tensor) -> Result<StackOutput> {
        self.forward(
            hidden,
            &Step::Prefill {
                input_mask: input_mask.clone(),
            },
        )
    }

    pub fn decode(
        &mut self,
        hidden: &Tensor,
        batch_valid_length: Option<&[usize]>,
    ) -> Result<StackOutput> {
        self.forward(
            hidden,
            &Step::Decode {
                batch_valid_length: batch_valid_length.map(<[usize]>::to_vec),
            },
        )
    }

    /// Empties every layer's cache so a new prompt can be primed.
    pub fn reset(&mut self) -> Result<()> {
        for block in &mut self.blocks {
            block.reset_cache()?;
        }
        Ok(())
    }

    /// A new session over the same weights with empty caches.
    pub fn fork(&self) -> Result<Self> {
        Ok(Self {
            config: self.config.clone(),
            blocks: self
                .blocks
                .iter()
                .map(DecoderBlock::fork)
                .collect::<Result<Vec<_>>>()?,
            causal: self.causal.clone(),
            ctx: self.ctx.clone(),
        })
    }

    fn run(&mut self, hidden: &Tensor, step: &LayerStep<'_>) -> Result<StackOutput> {
        let mut hidden = hidden.clone();
        let mut presents = Vec::with_capacity(self.blocks.len());
        for block in &mut self.blocks {
            let (out, present) = block.forward(&hidden, step)?;
            hidden = out;
            presents.extend(present);
        }
        Ok(StackOutput { hidden, presents })
    }
}
