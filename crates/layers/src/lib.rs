//! Building blocks for the attention block.
//!
//! This crate hosts the dense projections, embedding tables, dtype policy and
//! validation helpers assembled from Candle primitives.

pub mod checks;
pub mod dtypes;
pub mod embedding;
pub mod linear;

pub use dtypes::PrecisionPolicy;
pub use embedding::{Embedding, EmbeddingConfig};
pub use linear::{Linear, LinearConfig, LinearInit};
