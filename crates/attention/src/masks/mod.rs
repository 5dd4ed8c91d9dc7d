//! Mask utilities shared by the attention block.
//!
//! Masks handed to the engine are *keep* masks: nonzero entries mark positions
//! that may be attended to, zeros mark positions to discard. They are usually
//! `u8` and shaped `[batch, k_len]`, `[batch, q_len, k_len]`, or fully expanded
//! `[batch, heads|1, q_len, k_len]`. [`apply_mask`] turns a keep mask into an
//! additive penalty equal to the most negative finite value of the target
//! dtype, so masked positions vanish after softmax without producing NaNs on
//! fully masked rows.

pub mod apply;
pub mod causal;
pub mod padding;

use candle_core::DType;

/// Dtype produced by the mask builders.
pub const MASK_DTYPE: DType = DType::U8;

pub use apply::{apply_mask, min_value_of_dtype};
pub use causal::build_causal_mask;
pub use padding::{padding_mask_from_booleans, padding_mask_from_lengths};

#[cfg(test)]
mod tests;
