//! Core configuration and error types shared across the attention block.
//!
//! Tensors exchanged with callers use the layout `[batch, seq_len, hidden]`.
//! Internally heads are split out as `[batch, heads, seq_len, head_dim]`.

pub mod config;
pub mod errors;

pub use config::{AttentionConfig, InitScheme, Mode};
pub use errors::{AttentionError, Result};
