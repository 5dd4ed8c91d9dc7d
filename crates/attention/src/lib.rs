//! Configurable multi-head attention for Candle.
//!
//! [`GeneralAttention`] is a single attention block that covers:
//!
//! * self-attention over `[batch, seq, hidden]` inputs;
//! * decoder self-attention with an incremental [`KeyValueState`];
//! * decoder cross-attention over encoder states, with a cached projection;
//! * a learned, bucketed relative position bias ([`relative_bias`]).
//!
//! Scores come from any [`ScoringKind`]; the learned kinds own their
//! parameters. Masks are keep-masks (nonzero = attend) and are folded into the
//! position bias so later layers can reuse the masked bias as-is.
//!
//! Dropout on attention probabilities is active only in [`Mode::Train`].
//! [`variants`] holds the T5 and BERT presets, and [`mapping`] renames
//! checkpoint tensors from other toolkits.

pub mod core;
pub mod general;
pub mod kv_cache;
pub mod mapping;
pub mod masks;
pub mod relative_bias;
pub mod scoring;
pub mod variants;

pub use crate::core::{AttentionConfig, AttentionError, InitScheme, Mode, Result};
pub use general::{AttentionOutput, ForwardArgs, GeneralAttention};
pub use kv_cache::KeyValueState;
pub use mapping::{HeadsHint, ParameterMapping};
pub use relative_bias::{relative_position_bucket, RelativePositionBias};
pub use scoring::{ScoringFunction, ScoringKind};
pub use variants::{SelfAttention, SelfAttentionConfig, T5Args, T5Attention, T5Config};
