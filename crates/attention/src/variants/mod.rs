//! Presets reproducing the attention conventions of well-known models.

pub mod self_attention;
pub mod t5;

pub use self_attention::{SelfAttention, SelfAttentionConfig};
pub use t5::{T5Args, T5Attention, T5Config};
