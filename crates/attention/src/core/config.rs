//! Configuration for the general attention block.
//!
//! [`AttentionConfig`] is fixed at construction. It deserializes from JSON or
//! TOML with every field optional, falling back to the defaults of a
//! `t5-small`-sized encoder layer.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::core::errors::{AttentionError, Result};
use crate::scoring::ScoringKind;

/// Weight initialisation scheme applied once during construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitScheme {
    /// Uniform `±1/sqrt(fan_in)` projections and `N(0, 1)` bias embeddings.
    #[default]
    Standard,
    /// Normal initialisation with std derived from the layer sizes (T5 recipe).
    Scaled,
}

/// Whether stochastic layers are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Train,
    #[default]
    Eval,
}

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AttentionConfig {
    /// Width of the incoming hidden states.
    pub hidden_size: usize,
    /// Width of each attention head.
    pub attention_head_size: usize,
    pub num_attention_heads: usize,
    /// Function turning query/key pairs into raw scores.
    pub scoring_func: ScoringKind,
    /// Divisor basis for scaled dot-product scores; `None` uses the head size.
    pub scaling_factor: Option<usize>,
    /// Whether merged heads pass through a final output projection.
    pub output_projection: bool,
    /// Dropout probability on attention probabilities (train mode only).
    pub dropout: f32,
    /// Whether query/key/value/output projections carry a bias vector.
    pub bias: bool,
    pub init: InitScheme,
    pub is_decoder: bool,
    /// Keys and values come from encoder states. Requires `is_decoder`.
    pub is_cross_attention: bool,
    pub has_relative_attention_bias: bool,
    pub relative_attention_num_buckets: usize,
    /// Distances at or beyond this share the last logarithmic bucket.
    pub relative_attention_max_distance: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            hidden_size: 512,
            attention_head_size: 64,
            num_attention_heads: 8,
            scoring_func: ScoringKind::ScaledDotProduct,
            scaling_factor: None,
            output_projection: false,
            dropout: 0.0,
            bias: true,
            init: InitScheme::Standard,
            is_decoder: false,
            is_cross_attention: false,
            has_relative_attention_bias: false,
            relative_attention_num_buckets: 32,
            relative_attention_max_distance: 128,
        }
    }
}

impl AttentionConfig {
    /// Configuration with explicit sizes and defaults elsewhere.
    pub fn new(hidden_size: usize, attention_head_size: usize, num_attention_heads: usize) -> Self {
        Self {
            hidden_size,
            attention_head_size,
            num_attention_heads,
            ..Self::default()
        }
    }

    /// Loads and validates a configuration from a `.json` or `.toml` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: AttentionConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(AttentionError::config(format!(
                    "unsupported configuration extension '{other}'"
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the structural invariants of the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 || self.attention_head_size == 0 || self.num_attention_heads == 0
        {
            return Err(AttentionError::config(
                "hidden_size, attention_head_size and num_attention_heads must be non-zero",
            ));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(AttentionError::config(format!(
                "the hidden size ({}) is not a multiple of the number of attention heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.is_cross_attention && !self.is_decoder {
            return Err(AttentionError::config(
                "the attention layer can be a cross-attention layer only if it is within a decoder",
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(AttentionError::config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.scaling_factor == Some(0) {
            return Err(AttentionError::config("scaling_factor must be non-zero"));
        }
        if self.has_relative_attention_bias && self.relative_attention_num_buckets == 0 {
            return Err(AttentionError::config(
                "relative attention bias needs at least one bucket",
            ));
        }
        if self.has_relative_attention_bias
            && self.relative_attention_max_distance <= self.relative_attention_num_buckets / 2
        {
            return Err(AttentionError::config(format!(
                "relative_attention_max_distance ({}) must exceed half the bucket count ({})",
                self.relative_attention_max_distance, self.relative_attention_num_buckets
            )));
        }
        Ok(())
    }

    /// Total width of all heads combined.
    pub fn all_head_size(&self) -> usize {
        self.num_attention_heads * self.attention_head_size
    }

    /// Effective divisor basis for scaled dot-product scoring.
    pub fn effective_scaling_factor(&self) -> usize {
        self.scaling_factor.unwrap_or(self.attention_head_size)
    }

    pub fn with_scoring(mut self, scoring_func: ScoringKind) -> Self {
        self.scoring_func = scoring_func;
        self
    }

    pub fn with_output_projection(mut self, enabled: bool) -> Self {
        self.output_projection = enabled;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_init(mut self, init: InitScheme) -> Self {
        self.init = init;
        self
    }

    /// Marks the layer as a decoder, optionally attending over encoder states.
    pub fn with_decoder(mut self, is_cross_attention: bool) -> Self {
        self.is_decoder = true;
        self.is_cross_attention = is_cross_attention;
        self
    }

    /// Enables a learned relative position bias with `num_buckets` buckets.
    pub fn with_relative_bias(mut self, num_buckets: usize) -> Self {
        self.has_relative_attention_bias = true;
        self.relative_attention_num_buckets = num_buckets;
        self
    }
}
