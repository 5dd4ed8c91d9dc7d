//! Builders for padding keep masks shaped `[batch, k_len]`.

use candle_core::{bail, Device, Result, Tensor};

use super::MASK_DTYPE;

/// Construct padding masks from per-batch valid key lengths.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    k_len: usize,
) -> Result<Tensor> {
    let batch = key_lengths.len();
    let mut data = vec![0u8; batch * k_len];
    for (b, &valid) in key_lengths.iter().enumerate() {
        let valid = valid.min(k_len);
        data[b * k_len..b * k_len + valid].fill(1);
    }
    Tensor::from_vec(data, (batch, k_len), device)?.to_dtype(MASK_DTYPE)
}

/// Construct padding masks from boolean padding indicators.
///
/// Each inner slice corresponds to a batch element and must share the same
/// length. `true` indicates a padded (masked) key position.
pub fn padding_mask_from_booleans(device: &Device, padding: &[Vec<bool>]) -> Result<Tensor> {
    let k_len = padding.first().map(Vec::len).unwrap_or(0);
    if padding.iter().any(|row| row.len() != k_len) {
        bail!("all boolean padding masks must share k_len");
    }
    let data: Vec<u8> = padding
        .iter()
        .flat_map(|row| row.iter().map(|&is_padding| u8::from(!is_padding)))
        .collect();
    Tensor::from_vec(data, (padding.len(), k_len), device)?.to_dtype(MASK_DTYPE)
}
