use super::*;
use crate::core::Result;
use candle_core::{Device, Tensor};

fn idx(b: usize, i: usize, j: usize, seq: usize) -> usize {
    (b * seq + i) * seq + j
}

fn causal(seq: usize, validity: &[f32], batch: usize) -> Result<Vec<f32>> {
    let device = Device::Cpu;
    let mask = CausalMask::new(seq, &device)?;
    let input = Tensor::from_slice(validity, (batch, validity.len() / batch), &device)?;
    let out = mask.forward(&input)?;
    Ok(out.flatten_all()?.to_vec1::<f32>()?)
}

#[test]
fn right_padded_prompt_masks_padding_rows_and_columns() -> Result<()> {
    let values = causal(3, &[1.0, 1.0, 0.0], 1)?;
    let expected = [
        1.0, 0.0, 0.0, //
        1.0, 1.0, 0.0, //
        0.0, 0.0, 0.0,
    ];
    assert_eq!(values, expected);
    Ok(())
}

#[test]
fn mask_is_lower_triangular_intersected_with_validity() -> Result<()> {
    let seq = 4;
    let validity = [1.0f32, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
    let values = causal(seq, &validity, 2)?;
    for b in 0..2 {
        for i in 0..seq {
            for j in 0..seq {
                let valid = validity[b * seq + i] != 0.0 && validity[b * seq + j] != 0.0;
                let expected = if valid && j <= i { 1.0 } else { 0.0 };
                assert_eq!(values[idx(b, i, j, seq)], expected, "b={b} i={i} j={j}");
            }
        }
    }
    Ok(())
}

#[test]
fn shorter_prompts_use_leading_block() -> Result<()> {
    let values = causal(6, &[1.0, 1.0], 1)?;
    assert_eq!(values, vec![1.0, 0.0, 1.0, 1.0]);
    Ok(())
}

#[test]
fn non_binary_validity_counts_as_valid() -> Result<()> {
    let values = causal(2, &[3.0, 7.0], 1)?;
    assert_eq!(values, vec![1.0, 0.0, 1.0, 1.0]);
    Ok(())
}

#[test]
fn prompt_longer_than_mask_is_rejected() {
    let device = Device::Cpu;
    let mask = CausalMask::new(2, &device).unwrap();
    let input = Tensor::ones((1, 3), candle_core::DType::F32, &device).unwrap();
    assert!(matches!(
        mask.forward(&input),
        Err(crate::AttentionError::ShapeMismatch { .. })
    ));
}

#[test]
fn position_mask_opens_prefix_per_row() -> Result<()> {
    let device = Device::Cpu;
    let mask = position_mask(&device, &[0, 2], 4)?;
    assert_eq!(mask.dims(), &[2, 1, 1, 4]);
    assert_eq!(
        mask.flatten_all()?.to_vec1::<f32>()?,
        vec![1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0]
    );
    Ok(())
}

#[test]
fn position_mask_rejects_out_of_range_positions() {
    let device = Device::Cpu;
    assert!(position_mask(&device, &[4], 4).is_err());
}
