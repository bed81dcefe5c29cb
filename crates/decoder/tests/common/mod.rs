#![allow(dead_code)]

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use decoder::{ModelConfig, SeededInit};

pub const HIDDEN: usize = 8;

/// Two layers of two heads (`head_dim = 4`) over four slots, all in `f32`.
pub fn small_config(batch: usize) -> ModelConfig {
    ModelConfig::new(HIDDEN, 2, 2, 4, batch)
}

pub fn weights() -> SeededInit {
    SeededInit::new(11).with_bias_bound(0.1)
}

/// A deterministic, non-degenerate embedding for token `id`.
pub fn token(id: u64) -> Vec<f32> {
    (0..HIDDEN)
        .map(|i| ((id as f32 + 1.0) * 0.7 + i as f32 * 0.31).sin())
        .collect()
}

/// `[batch, seq, HIDDEN]`; `None` entries are zero padding.
pub fn states(rows: &[&[Option<u64>]]) -> Result<Tensor> {
    let seq = rows[0].len();
    let data: Vec<f32> = rows
        .iter()
        .flat_map(|row| {
            row.iter()
                .flat_map(|slot| slot.map(token).unwrap_or_else(|| vec![0.0; HIDDEN]))
        })
        .collect();
    Ok(Tensor::from_vec(data, (rows.len(), seq, HIDDEN), &Device::Cpu)?)
}

pub fn validity(rows: &[&[f32]]) -> Result<Tensor> {
    let seq = rows[0].len();
    let data: Vec<f32> = rows.iter().flat_map(|row| row.iter().copied()).collect();
    Ok(Tensor::from_vec(data, (rows.len(), seq), &Device::Cpu)?)
}

pub fn values(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let diff = a
        .to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_vec0::<f32>()?;
    Ok(diff)
}
