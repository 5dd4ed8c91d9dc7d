//! Builders for causal keep masks.
//!
//! The resulting tensors have dtype [`MASK_DTYPE`](super::MASK_DTYPE) and
//! shape `[batch, q_len, k_len]`. Entries are `1` where attention is permitted
//! and `0` otherwise.

use candle_core::{Device, Result, Tensor};

use super::MASK_DTYPE;

/// Construct a causal mask for the supplied sequence dimensions.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, allowing access to the extended prefix.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let mut data = vec![0u8; batch * q_len * k_len];

    for b in 0..batch {
        for q in 0..q_len {
            let row_start = (b * q_len + q) * k_len;
            let visible = (q + offset + 1).min(k_len);
            data[row_start..row_start + visible].fill(1);
        }
    }

    Tensor::from_vec(data, (batch, q_len, k_len), device)?.to_dtype(MASK_DTYPE)
}
