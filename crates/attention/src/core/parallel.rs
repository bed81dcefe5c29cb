//! Execution context and collectives for model-parallel ranks.
//!
//! Every constructor that allocates or slices weights receives an
//! [`ExecutionContext`] explicitly. Row-parallel matmuls produce partial sums
//! that are combined with [`Collective::all_reduce_sum`] before the bias is
//! added.

use std::sync::{Arc, Barrier, Mutex};

use candle_core::{Device, Tensor};

use super::errors::{AttentionError, Result};
use super::sharding::ParallelConfig;

/// Blocking, atomic reduction across the ranks of one model-parallel group.
pub trait Collective: Send + Sync + std::fmt::Debug {
    fn world_size(&self) -> usize;

    fn rank(&self) -> usize;

    /// Returns the element-wise sum of `tensor` over all ranks. Every rank
    /// must call this the same number of times with identically shaped input.
    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor>;
}

/// Single-rank collective; the reduction is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCollective;

impl Collective for LocalCollective {
    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }
}

#[derive(Debug)]
struct GroupState {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Tensor>>>,
}

/// All-reduce among ranks that live on threads of the same process.
///
/// Partial tensors are summed in rank order, so every rank observes a
/// bit-identical result.
#[derive(Debug, Clone)]
pub struct InProcessGroup {
    rank: usize,
    world_size: usize,
    state: Arc<GroupState>,
}

impl InProcessGroup {
    /// Creates one handle per rank; hand each to its own thread.
    pub fn create(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(AttentionError::config("collective world size must be > 0"));
        }
        let state = Arc::new(GroupState {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        });
        Ok((0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                state: Arc::clone(&state),
            })
            .collect())
    }

    fn poisoned() -> AttentionError {
        AttentionError::Collective {
            message: "collective slot lock poisoned".into(),
        }
    }

    fn gather_sum(&self) -> Result<Tensor> {
        let slots = self.state.slots.lock().map_err(|_| Self::poisoned())?;
        let mut acc: Option<Tensor> = None;
        for (rank, slot) in slots.iter().enumerate() {
            let part = slot.as_ref().ok_or_else(|| AttentionError::Collective {
                message: format!("rank {rank} did not contribute to all-reduce"),
            })?;
            acc = Some(match acc {
                Some(sum) => sum.add(part)?,
                None => part.clone(),
            });
        }
        acc.ok_or_else(|| AttentionError::Collective {
            message: "empty collective group".into(),
        })
    }
}

impl Collective for InProcessGroup {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        {
            let mut slots = self.state.slots.lock().map_err(|_| Self::poisoned())?;
            slots[self.rank] = Some(tensor.clone());
        }
        self.state.barrier.wait();
        let reduced = self.gather_sum();
        // Nobody may overwrite a slot until every rank has read all of them.
        self.state.barrier.wait();
        reduced
    }
}

/// Where this replica sits in the `dp x mp` grid and how it talks to peers.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub parallel: ParallelConfig,
    pub dp_rank: usize,
    pub mp_rank: usize,
    pub device: Device,
    pub collective: Arc<dyn Collective>,
}

impl ExecutionContext {
    pub fn new(
        parallel: ParallelConfig,
        dp_rank: usize,
        mp_rank: usize,
        device: Device,
        collective: Arc<dyn Collective>,
    ) -> Result<Self> {
        parallel.validate()?;
        if dp_rank >= parallel.data_parallel || mp_rank >= parallel.model_parallel {
            return Err(AttentionError::config(format!(
                "rank (dp={dp_rank}, mp={mp_rank}) outside grid {}x{}",
                parallel.data_parallel, parallel.model_parallel
            )));
        }
        if collective.world_size() != parallel.model_parallel || collective.rank() != mp_rank {
            return Err(AttentionError::config(format!(
                "collective (rank {} of {}) does not match mp rank {mp_rank} of {}",
                collective.rank(),
                collective.world_size(),
                parallel.model_parallel
            )));
        }
        Ok(Self {
            parallel,
            dp_rank,
            mp_rank,
            device,
            collective,
        })
    }

    /// Unsharded context on `device`.
    pub fn single(device: Device) -> Self {
        Self {
            parallel: ParallelConfig::default(),
            dp_rank: 0,
            mp_rank: 0,
            device,
            collective: Arc::new(LocalCollective),
        }
    }

    pub fn model_parallel(&self) -> usize {
        self.parallel.model_parallel
    }
}
