//! BERT-style encoder self-attention with a selectable scoring function.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::core::{AttentionConfig, AttentionError, Mode, Result};
use crate::general::{ForwardArgs, GeneralAttention};
use crate::mapping::{detect_self_attention, HeadsHint};
use crate::scoring::ScoringKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfAttentionConfig {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub dropout: f32,
    pub scoring_func: ScoringKind,
    pub output_projection: bool,
}

impl Default for SelfAttentionConfig {
    fn default() -> Self {
        Self {
            hidden_size: 768,
            num_attention_heads: 12,
            dropout: 0.0,
            scoring_func: ScoringKind::ScaledDotProduct,
            output_projection: false,
        }
    }
}

impl SelfAttentionConfig {
    pub fn new(hidden_size: usize, num_attention_heads: usize) -> Self {
        Self {
            hidden_size,
            num_attention_heads,
            ..Self::default()
        }
    }

    pub fn with_scoring(mut self, scoring_func: ScoringKind) -> Self {
        self.scoring_func = scoring_func;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_output_projection(mut self, enabled: bool) -> Self {
        self.output_projection = enabled;
        self
    }

    /// The general configuration this preset expands to. The head size is
    /// `hidden_size / num_attention_heads`.
    pub fn attention_config(&self) -> AttentionConfig {
        let head_size = if self.num_attention_heads == 0 {
            0
        } else {
            self.hidden_size / self.num_attention_heads
        };
        AttentionConfig::new(self.hidden_size, head_size, self.num_attention_heads)
            .with_scoring(self.scoring_func)
            .with_dropout(self.dropout)
            .with_output_projection(self.output_projection)
            .with_bias(true)
    }
}

#[derive(Debug, Clone)]
pub struct SelfAttention {
    inner: GeneralAttention,
}

impl SelfAttention {
    pub fn new(config: &SelfAttentionConfig, device: &Device, dtype: DType) -> Result<Self> {
        Ok(Self {
            inner: GeneralAttention::new(config.attention_config(), device, dtype)?,
        })
    }

    pub fn from_tensors(
        config: &SelfAttentionConfig,
        tensors: &HashMap<String, Tensor>,
    ) -> Result<Self> {
        Ok(Self {
            inner: GeneralAttention::from_tensors(config.attention_config(), tensors)?,
        })
    }

    /// Loads a BERT or DistilBERT attention block whose tensors are named
    /// relative to the block (`query.weight`, `q_lin.weight`, ...).
    pub fn from_pretrained(
        tensors: &HashMap<String, Tensor>,
        hint: HeadsHint,
        dropout: f32,
    ) -> Result<Self> {
        let names: Vec<&str> = tensors.keys().map(String::as_str).collect();
        let detected = detect_self_attention(&names, hint)?;
        let tensors = detected.mapping.remap_all(tensors);
        let query = tensors
            .get("query.weight")
            .ok_or_else(|| AttentionError::Parameter {
                name: "query.weight".to_string(),
                reason: "missing".to_string(),
            })?;
        let config = SelfAttentionConfig {
            hidden_size: query.dim(1)?,
            num_attention_heads: detected.num_attention_heads,
            dropout,
            scoring_func: ScoringKind::ScaledDotProduct,
            output_projection: detected.output_projection,
        };
        Self::from_tensors(&config, &tensors)
    }

    pub fn inner(&self) -> &GeneralAttention {
        &self.inner
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.inner.set_mode(mode);
    }

    /// Returns the context and, when requested, the attention probabilities.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        head_mask: Option<&Tensor>,
        output_attentions: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let output = self.inner.forward(
            hidden_states,
            ForwardArgs {
                attention_mask,
                head_mask,
                output_attentions,
                ..ForwardArgs::default()
            },
        )?;
        Ok((output.hidden_states, output.attention_probs))
    }
}
