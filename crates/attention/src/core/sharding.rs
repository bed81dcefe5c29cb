//! Tensor-parallel shard layouts.
//!
//! A [`ShardSpec`] tags every tensor dimension with the grid axis it is split
//! over. [`ShardLayout`] pairs the spec with a concrete `dp x mp` grid and
//! answers "how big is my slice" and "which indices are mine" questions.
//! Everything here is pure arithmetic on shapes.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, Result};

/// Data-parallel and model-parallel factors of the device grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub data_parallel: usize,
    pub model_parallel: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            data_parallel: 1,
            model_parallel: 1,
        }
    }
}

impl ParallelConfig {
    pub fn new(data_parallel: usize, model_parallel: usize) -> Result<Self> {
        let cfg = Self {
            data_parallel,
            model_parallel,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_parallel == 0 || self.model_parallel == 0 {
            return Err(AttentionError::config(format!(
                "parallel factors must be > 0, got dp={} mp={}",
                self.data_parallel, self.model_parallel
            )));
        }
        Ok(())
    }
}

/// Which grid axes a single dimension is split over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Partition {
    Replicated,
    Data,
    Model,
    DataModel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSpec {
    partitions: Vec<Partition>,
}

impl ShardSpec {
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self { partitions }
    }

    /// `[batch, heads, seq, head_dim]`: batch over dp, heads over mp.
    pub fn attention_heads() -> Self {
        Self::new(vec![
            Partition::Data,
            Partition::Model,
            Partition::Replicated,
            Partition::Replicated,
        ])
    }

    /// `[batch, seq, hidden]`: batch over dp, hidden over mp.
    pub fn hidden_states() -> Self {
        Self::new(vec![
            Partition::Data,
            Partition::Replicated,
            Partition::Model,
        ])
    }

    pub fn rank(&self) -> usize {
        self.partitions.len()
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    parallel: ParallelConfig,
    spec: ShardSpec,
}

impl ShardLayout {
    pub fn new(parallel: ParallelConfig, spec: ShardSpec) -> Self {
        Self { parallel, spec }
    }

    pub fn parallel(&self) -> ParallelConfig {
        self.parallel
    }

    pub fn spec(&self) -> &ShardSpec {
        &self.spec
    }

    /// Product of the grid factors dimension `dim` is split over.
    pub fn factor(&self, dim: usize) -> usize {
        match self.spec.partitions.get(dim) {
            Some(Partition::Data) => self.parallel.data_parallel,
            Some(Partition::Model) => self.parallel.model_parallel,
            Some(Partition::DataModel) => {
                self.parallel.data_parallel * self.parallel.model_parallel
            }
            Some(Partition::Replicated) | None => 1,
        }
    }

    pub fn validate(&self, global_shape: &[usize]) -> Result<()> {
        if global_shape.len() != self.spec.rank() {
            return Err(AttentionError::shape(format!(
                "shard spec has rank {}, tensor shape {global_shape:?} has rank {}",
                self.spec.rank(),
                global_shape.len()
            )));
        }
        for (dim, &extent) in global_shape.iter().enumerate() {
            let factor = self.factor(dim);
            if extent % factor != 0 {
                return Err(AttentionError::ShardMismatch {
                    dim,
                    extent,
                    factor,
                });
            }
        }
        Ok(())
    }

    /// Per-device shape: `global[d] / factor(d)`.
    pub fn local_shape(&self, global_shape: &[usize]) -> Result<Vec<usize>> {
        self.validate(global_shape)?;
        Ok(global_shape
            .iter()
            .enumerate()
            .map(|(dim, &extent)| extent / self.factor(dim))
            .collect())
    }

    /// Index range along `dim` owned by shard `rank` of that dimension's factor.
    pub fn local_range(&self, global_shape: &[usize], dim: usize, rank: usize) -> Result<Range<usize>> {
        let local = self.local_shape(global_shape)?;
        let factor = self.factor(dim);
        if rank >= factor {
            return Err(AttentionError::config(format!(
                "shard rank {rank} out of range for factor {factor} on dim {dim}"
            )));
        }
        let len = local[dim];
        Ok(rank * len..(rank + 1) * len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attention_heads_split_over_model_axis() {
        let layout = ShardLayout::new(
            ParallelConfig::new(1, 2).unwrap(),
            ShardSpec::attention_heads(),
        );
        assert_eq!(layout.local_shape(&[4, 8, 16, 64]).unwrap(), vec![4, 4, 16, 64]);
        assert_eq!(layout.local_range(&[4, 8, 16, 64], 1, 1).unwrap(), 4..8);
    }

    #[test]
    fn data_model_factor_multiplies() {
        let layout = ShardLayout::new(
            ParallelConfig::new(2, 4).unwrap(),
            ShardSpec::new(vec![Partition::DataModel, Partition::Replicated]),
        );
        assert_eq!(layout.factor(0), 8);
        assert_eq!(layout.local_shape(&[16, 3]).unwrap(), vec![2, 3]);
    }

    #[test]
    fn indivisible_extent_is_a_shard_mismatch() {
        let layout = ShardLayout::new(
            ParallelConfig::new(1, 3).unwrap(),
            ShardSpec::hidden_states(),
        );
        match layout.validate(&[1, 4, 8]) {
            Err(AttentionError::ShardMismatch { dim, extent, factor }) => {
                assert_eq!((dim, extent, factor), (2, 8, 3));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rank_mismatch_is_a_shape_error() {
        let layout = ShardLayout::new(ParallelConfig::default(), ShardSpec::hidden_states());
        assert!(matches!(
            layout.validate(&[1, 2]),
            Err(AttentionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn zero_factors_are_rejected() {
        assert!(ParallelConfig::new(0, 1).is_err());
    }
}
