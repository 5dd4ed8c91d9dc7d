//! Key/value state carried between incremental decoding steps.
//!
//! The caller owns a [`KeyValueState`] for each decoding session and hands it
//! back on the next step. The attention block never mutates a state in place:
//! growing the cache produces a new state by concatenating along the sequence
//! axis.

use candle_core::{Result, Tensor};

/// Projected keys and values shaped `[batch, heads, past_len, head_dim]`.
#[derive(Debug, Clone)]
pub struct KeyValueState {
    pub key_state: Tensor,
    pub value_state: Tensor,
}

impl KeyValueState {
    pub fn new(key_state: Tensor, value_state: Tensor) -> Self {
        Self {
            key_state,
            value_state,
        }
    }

    /// Number of cached sequence positions.
    pub fn seq_len(&self) -> usize {
        self.key_state.dims().get(2).copied().unwrap_or(0)
    }

    /// Returns a new state with `key`/`value` appended after the cached positions.
    pub fn extend(&self, key: &Tensor, value: &Tensor) -> Result<Self> {
        Ok(Self {
            key_state: Tensor::cat(&[&self.key_state, key], 2)?,
            value_state: Tensor::cat(&[&self.value_state, value], 2)?,
        })
    }
}
