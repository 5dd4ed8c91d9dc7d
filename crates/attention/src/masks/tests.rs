use super::*;
use candle_core::{DType, Device, Result, Tensor};

#[test]
fn causal_mask_respects_offsets() -> Result<()> {
    let device = Device::Cpu;
    let mask = build_causal_mask(&device, 1, 3, 5)?;
    assert_eq!(mask.dims(), &[1, 3, 5]);

    let rows = mask.squeeze(0)?.to_vec2::<u8>()?;
    // Earliest query sees the prefix (offset = k_len - q_len) plus itself.
    assert_eq!(rows[0], vec![1, 1, 1, 0, 0]);
    assert_eq!(rows[2], vec![1, 1, 1, 1, 1]);
    Ok(())
}

#[test]
fn causal_mask_handles_short_keys() -> Result<()> {
    let device = Device::Cpu;
    let mask = build_causal_mask(&device, 1, 4, 2)?;
    let rows = mask.squeeze(0)?.to_vec2::<u8>()?;
    assert_eq!(rows[0], vec![1, 0]);
    assert_eq!(rows[3], vec![1, 1]);
    Ok(())
}

#[test]
fn padding_mask_from_lengths_masks_tail() -> Result<()> {
    let device = Device::Cpu;
    let mask = padding_mask_from_lengths(&device, &[2, 5, 7], 5)?;
    assert_eq!(
        mask.to_vec2::<u8>()?,
        vec![
            vec![1, 1, 0, 0, 0],
            vec![1, 1, 1, 1, 1],
            vec![1, 1, 1, 1, 1]
        ]
    );
    Ok(())
}

#[test]
fn padding_mask_from_booleans_inverts_padding_flags() -> Result<()> {
    let device = Device::Cpu;
    let mask = padding_mask_from_booleans(&device, &[vec![false, true], vec![true, false]])?;
    assert_eq!(mask.to_vec2::<u8>()?, vec![vec![1, 0], vec![0, 1]]);
    assert!(padding_mask_from_booleans(&device, &[vec![false], vec![true, false]]).is_err());
    Ok(())
}

#[test]
fn all_keep_mask_is_identity() -> Result<()> {
    let device = Device::Cpu;
    let scores = Tensor::randn(0f32, 3.0, (2, 2, 3, 3), &device)?;
    let keep = Tensor::ones((2, 3), DType::U8, &device)?;
    let masked = apply_mask(&scores, &keep)?;
    assert_eq!(
        masked.flatten_all()?.to_vec1::<f32>()?,
        scores.flatten_all()?.to_vec1::<f32>()?
    );
    Ok(())
}

#[test]
fn masked_positions_receive_dtype_minimum() -> Result<()> {
    let device = Device::Cpu;
    let values = Tensor::zeros((1, 2, 1, 3), DType::F32, &device)?;
    let keep = Tensor::from_vec(vec![1u8, 0, 1], (1, 3), &device)?;
    let masked = apply_mask(&values, &keep)?;
    assert_eq!(masked.dims(), &[1, 2, 1, 3]);
    let flat = masked.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(flat, vec![0.0, f32::MIN, 0.0, 0.0, f32::MIN, 0.0]);
    Ok(())
}

#[test]
fn bias_broadcasts_over_batch_when_masked() -> Result<()> {
    let device = Device::Cpu;
    let bias = Tensor::zeros((1, 2, 3, 3), DType::F32, &device)?;
    let keep = build_causal_mask(&device, 4, 3, 3)?;
    let masked = apply_mask(&bias, &keep)?;
    assert_eq!(masked.dims(), &[4, 2, 3, 3]);
    Ok(())
}

#[test]
fn fully_masked_rows_stay_finite_after_softmax() -> Result<()> {
    let device = Device::Cpu;
    let values = Tensor::randn(0f32, 1.0, (1, 1, 2, 4), &device)?;
    let keep = Tensor::zeros((1, 4), DType::U8, &device)?;
    let probs = candle_nn::ops::softmax_last_dim(&apply_mask(&values, &keep)?)?;
    let flat = probs.flatten_all()?.to_vec1::<f32>()?;
    assert!(flat.iter().all(|p| p.is_finite()));
    Ok(())
}

#[test]
fn rejects_rank_one_masks() -> Result<()> {
    let device = Device::Cpu;
    let values = Tensor::zeros((1, 1, 1, 3), DType::F32, &device)?;
    let keep = Tensor::ones(3, DType::U8, &device)?;
    assert!(apply_mask(&values, &keep).is_err());
    Ok(())
}

#[test]
fn min_value_rejects_integer_dtypes() {
    assert!(min_value_of_dtype(DType::U32).is_err());
    assert_eq!(min_value_of_dtype(DType::F32).unwrap(), f64::from(f32::MIN));
}

#[test]
fn masking_twice_saturates_instead_of_overflowing() -> Result<()> {
    let device = Device::Cpu;
    let values = Tensor::zeros((1, 1, 1, 2), DType::F32, &device)?;
    let keep = Tensor::from_vec(vec![1u8, 0], (1, 2), &device)?;
    let twice = apply_mask(&apply_mask(&values, &keep)?, &keep)?;
    let flat = twice.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(flat, vec![0.0, f32::MIN]);
    Ok(())
}
