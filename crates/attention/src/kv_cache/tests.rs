use super::*;
use crate::core::{AttentionError, Result};
use crate::masks::position_mask;
use candle_core::{DType, Device, Tensor};
use static_assertions::{assert_impl_all, assert_not_impl_any};

assert_impl_all!(KvCache: Send);
assert_not_impl_any!(KvCache: Sync);

fn allclose(a: &Tensor, b: &Tensor, tol: f32) {
    let diff = a
        .to_dtype(DType::F32)
        .unwrap()
        .sub(&b.to_dtype(DType::F32).unwrap())
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    let max = diff.into_iter().fold(0.0_f32, |acc, v| acc.max(v));
    assert!(max <= tol, "max diff {max} exceeded tolerance {tol}");
}

fn layout(batch: usize, heads: usize, slots: usize, dim: usize) -> CacheLayout {
    CacheLayout::new(batch, heads, slots, dim).unwrap()
}

/// Strictly positive values so no real token looks like padding.
fn block(batch: usize, heads: usize, seq: usize, dim: usize, base: f32) -> Tensor {
    let total = batch * heads * seq * dim;
    let data: Vec<f32> = (0..total).map(|i| base + i as f32 * 0.01).collect();
    Tensor::from_vec(data, (batch, heads, seq, dim), &Device::Cpu).unwrap()
}

#[test]
fn prime_pads_and_zeroes_invalid_slots() -> Result<()> {
    let device = Device::Cpu;
    let mut cache = KvCache::new(layout(1, 2, 4, 3), DType::F32, &device)?;
    let keys = block(1, 2, 3, 3, 1.0);
    let values = block(1, 2, 3, 3, 2.0);
    let validity = Tensor::from_slice(&[1f32, 1.0, 0.0], (1, 3), &device)?;
    cache.prime_with_validity(&keys, &values, &validity)?;

    assert_eq!(cache.state(), CacheState::Primed);
    assert_eq!(cache.keys().dims(), &[1, 2, 4, 3]);
    allclose(&cache.keys().narrow(2, 0, 2)?, &keys.narrow(2, 0, 2)?, 0.0);
    allclose(&cache.values().narrow(2, 0, 2)?, &values.narrow(2, 0, 2)?, 0.0);
    let tail = cache.keys().narrow(2, 2, 2)?.abs()?.sum_all()?.to_vec0::<f32>()?;
    assert_eq!(tail, 0.0);
    assert_eq!(cache.validity().to_vec2::<f32>()?, vec![vec![1.0, 1.0, 0.0, 0.0]]);
    Ok(())
}

#[test]
fn prime_infers_validity_from_nonzero_keys() -> Result<()> {
    let device = Device::Cpu;
    let mut cache = KvCache::new(layout(1, 1, 4, 2), DType::F32, &device)?;
    let keys = Tensor::from_slice(&[0.5f32, 0.1, 0.7, 0.2, 0.0, 0.0], (1, 1, 3, 2), &device)?;
    cache.prime(&keys, &keys)?;
    assert_eq!(cache.validity().to_vec2::<f32>()?, vec![vec![1.0, 1.0, 0.0, 0.0]]);
    assert_eq!(cache.occupancy()?, vec![2]);
    Ok(())
}

#[test]
fn extend_writes_exactly_one_slot_per_row() -> Result<()> {
    let device = Device::Cpu;
    let mut cache = KvCache::new(layout(2, 2, 5, 3), DType::F32, &device)?;
    let prompt = block(2, 2, 3, 3, 1.0);
    let validity = Tensor::from_slice(&[1f32, 1.0, 1.0, 1.0, 0.0, 0.0], (2, 3), &device)?;
    cache.prime_with_validity(&prompt, &prompt, &validity)?;
    let before = cache.snapshot();

    let key = block(2, 2, 1, 3, 9.0);
    let written = cache.extend(&key, &key, &SlotPosition::Explicit(vec![3, 1]))?;
    assert_eq!(written, vec![3, 1]);
    assert_eq!(cache.state(), CacheState::Extended);

    let after = cache.snapshot();
    assert!(after.version > before.version);
    for (b, slot) in [(0usize, 3usize), (1, 1)] {
        for s in 0..5 {
            let got = after.keys.get(b)?.narrow(1, s, 1)?;
            let expected = if s == slot {
                key.get(b)?
            } else {
                before.keys.get(b)?.narrow(1, s, 1)?
            };
            allclose(&got, &expected, 0.0);
        }
    }
    assert_eq!(
        cache.validity().to_vec2::<f32>()?,
        vec![vec![1.0, 1.0, 1.0, 1.0, 0.0], vec![1.0, 1.0, 0.0, 0.0, 0.0]]
    );
    Ok(())
}

#[test]
fn end_to_end_prompt_then_single_extend() -> Result<()> {
    let device = Device::Cpu;
    let mut cache = KvCache::new(layout(1, 2, 4, 4), DType::F32, &device)?;
    let prompt = block(1, 2, 4, 4, 1.0);
    let validity = Tensor::from_slice(&[1f32, 1.0, 0.0, 0.0], (1, 4), &device)?;
    cache.prime_with_validity(&prompt, &prompt, &validity)?;

    let token = block(1, 2, 1, 4, 5.0);
    let inferred = cache.resolve_positions(&SlotPosition::Inferred)?;
    assert_eq!(inferred, vec![2]);
    let written = cache.extend(&token, &token, &SlotPosition::Explicit(vec![2]))?;
    assert_eq!(written, vec![2]);

    let mask = position_mask(&device, &written, 4)?
        .broadcast_mul(&cache.validity().unsqueeze(1)?.unsqueeze(1)?)?;
    assert_eq!(mask.flatten_all()?.to_vec1::<f32>()?, vec![1.0, 1.0, 1.0, 0.0]);
    assert_eq!(cache.occupancy()?, vec![3]);
    Ok(())
}

#[test]
fn extend_before_prime_is_rejected() -> Result<()> {
    let mut cache = KvCache::new(layout(1, 1, 4, 2), DType::F32, &Device::Cpu)?;
    let token = block(1, 1, 1, 2, 1.0);
    assert!(matches!(
        cache.extend(&token, &token, &SlotPosition::Inferred),
        Err(AttentionError::CacheNotPrimed)
    ));
    Ok(())
}

#[test]
fn prime_on_dirty_cache_requires_reset() -> Result<()> {
    let mut cache = KvCache::new(layout(1, 1, 4, 2), DType::F32, &Device::Cpu)?;
    let prompt = block(1, 1, 2, 2, 1.0);
    cache.prime(&prompt, &prompt)?;
    assert!(matches!(
        cache.prime(&prompt, &prompt),
        Err(AttentionError::CacheDirty {
            state: CacheState::Primed
        })
    ));

    cache.reset()?;
    assert_eq!(cache.state(), CacheState::Empty);
    assert_eq!(cache.keys().abs()?.sum_all()?.to_vec0::<f32>()?, 0.0);
    cache.prime(&prompt, &prompt)?;
    Ok(())
}

#[test]
fn positions_past_capacity_overflow() -> Result<()> {
    let mut cache = KvCache::new(layout(1, 1, 3, 2), DType::F32, &Device::Cpu)?;
    let prompt = block(1, 1, 3, 2, 1.0);
    cache.prime(&prompt, &prompt)?;
    let token = block(1, 1, 1, 2, 1.0);
    assert!(matches!(
        cache.extend(&token, &token, &SlotPosition::Inferred),
        Err(AttentionError::CacheOverflow {
            position: 3,
            capacity: 3
        })
    ));
    assert!(matches!(
        cache.extend(&token, &token, &SlotPosition::Explicit(vec![7])),
        Err(AttentionError::CacheOverflow { .. })
    ));
    Ok(())
}

#[test]
fn wrong_position_count_is_a_shape_error() -> Result<()> {
    let mut cache = KvCache::new(layout(2, 1, 4, 2), DType::F32, &Device::Cpu)?;
    let prompt = block(2, 1, 2, 2, 1.0);
    cache.prime(&prompt, &prompt)?;
    let token = block(2, 1, 1, 2, 1.0);
    assert!(matches!(
        cache.extend(&token, &token, &SlotPosition::Explicit(vec![2])),
        Err(AttentionError::ShapeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn versions_increase_strictly() -> Result<()> {
    let mut cache = KvCache::new(layout(1, 1, 4, 2), DType::F16, &Device::Cpu)?;
    let prompt = block(1, 1, 2, 2, 1.0);
    let token = block(1, 1, 1, 2, 3.0);
    let mut seen = vec![cache.version()];
    cache.prime(&prompt, &prompt)?;
    seen.push(cache.version());
    cache.extend(&token, &token, &SlotPosition::Inferred)?;
    seen.push(cache.version());
    cache.reset()?;
    seen.push(cache.version());
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(cache.keys().dtype(), DType::F16);
    Ok(())
}

#[test]
fn left_padded_rows_resolve_past_the_prompt() -> Result<()> {
    let device = Device::Cpu;
    let mut cache = KvCache::new(layout(2, 1, 6, 2), DType::F32, &device)?;
    let prompt = block(2, 1, 4, 2, 1.0);
    let validity = Tensor::from_slice(
        &[0f32, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0],
        (2, 4),
        &device,
    )?;
    cache.prime_with_validity(&prompt, &prompt, &validity)?;

    assert_eq!(cache.occupancy()?, vec![4, 2]);
    assert_eq!(
        cache.resolve_positions(&SlotPosition::ValidLength(vec![3, 2]))?,
        vec![4, 2]
    );
    assert_eq!(cache.resolve_positions(&SlotPosition::Inferred)?, vec![4, 2]);
    Ok(())
}

#[test]
fn extend_never_overwrites_a_valid_slot() -> Result<()> {
    let device = Device::Cpu;
    let mut cache = KvCache::new(layout(1, 1, 6, 2), DType::F32, &device)?;
    let prompt = block(1, 1, 4, 2, 1.0);
    let validity = Tensor::from_slice(&[0f32, 1.0, 1.0, 1.0], (1, 4), &device)?;
    cache.prime_with_validity(&prompt, &prompt, &validity)?;
    let before = cache.snapshot();

    let token = block(1, 1, 1, 2, 7.0);
    assert!(matches!(
        cache.extend(&token, &token, &SlotPosition::Explicit(vec![3])),
        Err(AttentionError::SlotOccupied { row: 0, slot: 3 })
    ));
    assert_eq!(cache.version(), before.version);
    assert_eq!(cache.state(), CacheState::Primed);
    allclose(cache.keys(), &before.keys, 0.0);

    // The padded slot in front of the prompt is free.
    assert_eq!(
        cache.extend(&token, &token, &SlotPosition::Explicit(vec![0]))?,
        vec![0]
    );
    Ok(())
}

#[test]
fn reset_prime_then_several_extends_keeps_every_row_in_order() -> Result<()> {
    let device = Device::Cpu;
    let mut cache = KvCache::new(layout(1, 2, 6, 3), DType::F32, &device)?;
    let stale = block(1, 2, 5, 3, 4.0);
    cache.prime(&stale, &stale)?;
    cache.reset()?;

    let keys = block(1, 2, 2, 3, 1.0);
    let values = block(1, 2, 2, 3, 2.0);
    cache.prime(&keys, &values)?;
    let tokens: Vec<(Tensor, Tensor)> = (0..3)
        .map(|i| {
            let base = 10.0 + i as f32;
            (block(1, 2, 1, 3, base), block(1, 2, 1, 3, base + 0.5))
        })
        .collect();
    for (i, (key, value)) in tokens.iter().enumerate() {
        let written = cache.extend(key, value, &SlotPosition::Inferred)?;
        assert_eq!(written, vec![2 + i]);
    }

    allclose(&cache.keys().narrow(2, 0, 2)?, &keys, 0.0);
    allclose(&cache.values().narrow(2, 0, 2)?, &values, 0.0);
    for (i, (key, value)) in tokens.iter().enumerate() {
        allclose(&cache.keys().narrow(2, 2 + i, 1)?, key, 0.0);
        allclose(&cache.values().narrow(2, 2 + i, 1)?, value, 0.0);
    }
    for buffer in [cache.keys(), cache.values()] {
        let tail = buffer.narrow(2, 5, 1)?.abs()?.sum_all()?.to_vec0::<f32>()?;
        assert_eq!(tail, 0.0);
    }
    assert_eq!(
        cache.validity().to_vec2::<f32>()?,
        vec![vec![1.0, 1.0, 1.0, 1.0, 1.0, 0.0]]
    );
    Ok(())
}

#[test]
fn empty_block_is_a_shape_error() -> Result<()> {
    let mut cache = KvCache::new(layout(1, 1, 4, 2), DType::F32, &Device::Cpu)?;
    let empty = Tensor::zeros((1, 1, 0, 2), DType::F32, &Device::Cpu)?;
    assert!(matches!(
        cache.prime(&empty, &empty),
        Err(AttentionError::ShapeMismatch { .. })
    ));
    Ok(())
}
