//! Where block parameters come from.
//!
//! Every parameter is requested by its global name and full (unsharded)
//! shape; the block slices out its own model-parallel shard afterwards.

use std::collections::HashMap;
use std::path::Path;

use candle_core::safetensors::load as load_safetensors;
use candle_core::{DType, Device, Tensor};
use layers::LinearInit;

use crate::config::ModelConfig;
use crate::error::{DecoderError, Result};

pub trait WeightSource: Send + Sync {
    /// Returns the full parameter `name` with `shape`, in `dtype` on `device`.
    fn fetch(&self, name: &str, shape: &[usize], dtype: DType, device: &Device) -> Result<Tensor>;
}

/// Parameter names for block `layer`.
#[derive(Debug, Clone)]
pub struct BlockWeightNames {
    prefix: String,
}

impl BlockWeightNames {
    pub fn new(layer: usize) -> Self {
        Self {
            prefix: format!("blocks.{layer}"),
        }
    }

    pub fn name(&self, suffix: &str) -> String {
        format!("{}.{suffix}", self.prefix)
    }
}

/// Deterministic Xavier-uniform weights keyed by `(seed, name)`.
///
/// Biases and `beta` are zero and `gamma` is one unless
/// [`SeededInit::with_bias_bound`] asks for random biases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeededInit {
    seed: u64,
    bias_bound: Option<f32>,
}

impl SeededInit {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            bias_bound: None,
        }
    }

    /// Seeded from the `seed` field of `config`.
    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.seed)
    }

    /// Draws biases uniformly from `[-bound, bound]` instead of zeros.
    pub fn with_bias_bound(mut self, bound: f32) -> Self {
        self.bias_bound = Some(bound);
        self
    }

    fn seed_for(&self, name: &str) -> u64 {
        self.seed ^ fnv1a(name.as_bytes())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, &b| (hash ^ b as u64).wrapping_mul(PRIME))
}

impl WeightSource for SeededInit {
    fn fetch(&self, name: &str, shape: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
        let seed = self.seed_for(name);
        let suffix = name.rsplit('.').next().unwrap_or(name);
        match (suffix, shape) {
            ("weight", &[out_dim, in_dim]) => {
                Ok(LinearInit::XavierUniform.sample((out_dim, in_dim), seed, dtype, device)?)
            }
            ("bias" | "beta", &[len]) => match self.bias_bound {
                Some(bound) => Ok(LinearInit::Uniform { bound }
                    .sample((1, len), seed, dtype, device)?
                    .reshape(len)?),
                None => Ok(Tensor::zeros(len, dtype, device)?),
            },
            ("gamma", &[len]) => Ok(Tensor::ones(len, dtype, device)?),
            _ => Err(DecoderError::weight(
                name,
                format!("no initialiser for shape {shape:?}"),
            )),
        }
    }
}

/// Externally supplied tensors, e.g. a converted checkpoint.
#[derive(Debug, Clone, Default)]
pub struct TensorMap {
    tensors: HashMap<String, Tensor>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let tensors = load_safetensors(path.as_ref(), device)?;
        Ok(Self { tensors })
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl From<HashMap<String, Tensor>> for TensorMap {
    fn from(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }
}

impl WeightSource for TensorMap {
    fn fetch(&self, name: &str, shape: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
        let tensor = self
            .tensors
            .get(name)
            .ok_or_else(|| DecoderError::weight(name, "missing"))?;
        if tensor.dims() != shape {
            return Err(DecoderError::weight(
                name,
                format!("expected shape {shape:?}, found {:?}", tensor.dims()),
            ));
        }
        Ok(tensor.to_device(device)?.to_dtype(dtype)?.contiguous()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_init_is_reproducible_per_name() {
        let device = Device::Cpu;
        let init = SeededInit::new(7);
        let a = init
            .fetch("blocks.0.attention.dense1.weight", &[4, 4], DType::F32, &device)
            .unwrap();
        let b = init
            .fetch("blocks.0.attention.dense1.weight", &[4, 4], DType::F32, &device)
            .unwrap();
        let c = init
            .fetch("blocks.0.attention.dense2.weight", &[4, 4], DType::F32, &device)
            .unwrap();
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b.flatten_all().unwrap().to_vec1::<f32>().unwrap());
        assert_ne!(a, c.flatten_all().unwrap().to_vec1::<f32>().unwrap());
    }

    #[test]
    fn config_seed_selects_the_draw() {
        let device = Device::Cpu;
        let name = "blocks.1.mlp.mapping.weight";
        let mut config = ModelConfig::new(8, 2, 2, 4, 1);
        config.seed = 42;
        let draw = |init: &SeededInit| {
            init.fetch(name, &[4, 8], DType::F32, &device)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        };
        let from_config = draw(&SeededInit::from_config(&config));
        assert_eq!(from_config, draw(&SeededInit::new(42)));
        assert_ne!(from_config, draw(&SeededInit::new(0)));
    }

    #[test]
    fn norm_parameters_default_to_identity() {
        let device = Device::Cpu;
        let init = SeededInit::new(0);
        let gamma = init
            .fetch("blocks.0.layernorm1.gamma", &[3], DType::F32, &device)
            .unwrap();
        let beta = init
            .fetch("blocks.0.layernorm1.beta", &[3], DType::F32, &device)
            .unwrap();
        assert_eq!(gamma.to_vec1::<f32>().unwrap(), vec![1.0; 3]);
        assert_eq!(beta.to_vec1::<f32>().unwrap(), vec![0.0; 3]);
        assert!(init
            .fetch("blocks.0.layernorm1.scale", &[3], DType::F32, &device)
            .is_err());
    }

    #[test]
    fn tensor_map_checks_shapes_and_casts() {
        let device = Device::Cpu;
        let mut map = TensorMap::new();
        map.insert("w", Tensor::ones((2, 3), DType::F32, &device).unwrap());
        let w = map.fetch("w", &[2, 3], DType::F16, &device).unwrap();
        assert_eq!(w.dtype(), DType::F16);
        assert!(matches!(
            map.fetch("w", &[3, 2], DType::F32, &device),
            Err(DecoderError::Weight { .. })
        ));
        assert!(matches!(
            map.fetch("missing", &[1], DType::F32, &device),
            Err(DecoderError::Weight { .. })
        ));
    }
}
