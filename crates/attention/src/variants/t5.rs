//! T5 attention: scaled initialisation, no projection bias, unscaled scores.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::core::{AttentionConfig, InitScheme, Mode, Result};
use crate::general::{AttentionOutput, ForwardArgs, GeneralAttention};
use crate::kv_cache::KeyValueState;
use crate::mapping::ParameterMapping;
use crate::scoring::ScoringKind;

/// Hyper-parameters of a T5 attention layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct T5Config {
    pub is_decoder: bool,
    pub hidden_size: usize,
    pub key_value_proj_dim: usize,
    pub num_heads: usize,
    pub has_relative_attention_bias: bool,
    pub relative_attention_num_buckets: usize,
    pub dropout: f32,
    /// Use the size-dependent normal initialisation.
    pub normalize: bool,
    pub is_cross_attention: bool,
}

impl Default for T5Config {
    fn default() -> Self {
        Self {
            is_decoder: false,
            hidden_size: 512,
            key_value_proj_dim: 64,
            num_heads: 8,
            has_relative_attention_bias: false,
            relative_attention_num_buckets: 32,
            dropout: 0.1,
            normalize: true,
            is_cross_attention: false,
        }
    }
}

impl T5Config {
    pub fn with_relative_bias(mut self) -> Self {
        self.has_relative_attention_bias = true;
        self
    }

    pub fn decoder(mut self, is_cross_attention: bool) -> Self {
        self.is_decoder = true;
        self.is_cross_attention = is_cross_attention;
        self
    }

    /// The general configuration this preset expands to.
    pub fn attention_config(&self) -> AttentionConfig {
        AttentionConfig {
            hidden_size: self.hidden_size,
            attention_head_size: self.key_value_proj_dim,
            num_attention_heads: self.num_heads,
            scoring_func: ScoringKind::ScaledDotProduct,
            // The 1/sqrt(d) factor is folded into the query initialisation.
            scaling_factor: Some(1),
            output_projection: true,
            dropout: self.dropout,
            bias: false,
            init: if self.normalize {
                InitScheme::Scaled
            } else {
                InitScheme::Standard
            },
            is_decoder: self.is_decoder,
            is_cross_attention: self.is_cross_attention,
            has_relative_attention_bias: self.has_relative_attention_bias,
            relative_attention_num_buckets: self.relative_attention_num_buckets,
            ..AttentionConfig::default()
        }
    }
}

/// Per-call inputs of [`T5Attention::forward`].
#[derive(Debug, Clone, Copy, Default)]
pub struct T5Args<'a> {
    pub mask: Option<&'a Tensor>,
    /// Encoder output for cross-attention.
    pub key_value_states: Option<&'a Tensor>,
    pub position_bias: Option<&'a Tensor>,
    pub past_key_value: Option<&'a KeyValueState>,
    pub layer_head_mask: Option<&'a Tensor>,
    pub use_cache: bool,
    pub output_attentions: bool,
}

#[derive(Debug, Clone)]
pub struct T5Attention {
    inner: GeneralAttention,
}

impl T5Attention {
    pub fn new(config: &T5Config, device: &Device, dtype: DType) -> Result<Self> {
        Ok(Self {
            inner: GeneralAttention::new(config.attention_config(), device, dtype)?,
        })
    }

    /// Loads a Hugging Face T5 attention block (`q`, `k`, `v`, `o`,
    /// `relative_attention_bias`).
    pub fn from_pretrained(config: &T5Config, tensors: &HashMap<String, Tensor>) -> Result<Self> {
        let tensors = ParameterMapping::huggingface_t5().remap_all(tensors);
        Ok(Self {
            inner: GeneralAttention::from_tensors(config.attention_config(), &tensors)?,
        })
    }

    pub fn inner(&self) -> &GeneralAttention {
        &self.inner
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.inner.set_mode(mode);
    }

    pub fn compute_bias(&self, query_length: usize, key_length: usize) -> Result<Tensor> {
        self.inner.compute_bias(query_length, key_length)
    }

    /// Self-attention, or attention over `key_value_states` in a
    /// cross-attention layer. In cross-attention `mask` covers the encoder
    /// positions.
    pub fn forward(&self, hidden_states: &Tensor, args: T5Args<'_>) -> Result<AttentionOutput> {
        let (attention_mask, source_attention_mask) = if self.inner.config().is_cross_attention {
            (None, args.mask)
        } else {
            (args.mask, None)
        };
        self.inner.forward(
            hidden_states,
            ForwardArgs {
                past_key_states: args.past_key_value.map(|state| &state.key_state),
                past_value_states: args.past_key_value.map(|state| &state.value_state),
                attention_mask,
                source_states: args.key_value_states,
                source_attention_mask,
                head_mask: args.layer_head_mask,
                position_bias: args.position_bias,
                output_attentions: args.output_attentions,
                use_cache: args.use_cache,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> T5Config {
        T5Config {
            hidden_size: 8,
            key_value_proj_dim: 4,
            num_heads: 2,
            relative_attention_num_buckets: 8,
            ..T5Config::default()
        }
    }

    #[test]
    fn preset_fixes_t5_conventions() {
        let config = T5Config::default().attention_config();
        assert_eq!(config.scaling_factor, Some(1));
        assert!(config.output_projection);
        assert!(!config.bias);
        assert_eq!(config.init, InitScheme::Scaled);
        assert_eq!(config.dropout, 0.1);
        assert_eq!(config.relative_attention_num_buckets, 32);

        let plain = T5Config {
            normalize: false,
            ..T5Config::default()
        };
        assert_eq!(plain.attention_config().init, InitScheme::Standard);
    }

    #[test]
    fn encoder_layer_returns_bias_for_siblings() -> Result<()> {
        let device = Device::Cpu;
        let attention = T5Attention::new(&tiny().with_relative_bias(), &device, DType::F32)?;
        let hidden = Tensor::randn(0f32, 1.0, (2, 5, 8), &device)?;
        let output = attention.forward(&hidden, T5Args::default())?;
        assert_eq!(output.hidden_states.dims(), &[2, 5, 8]);
        let bias = output.position_bias.expect("bias returned");
        assert_eq!(bias.dims(), &[1, 2, 5, 5]);
        assert!(output.key_value_state.is_none());
        Ok(())
    }

    #[test]
    fn parameters_have_no_bias_vectors() -> Result<()> {
        let device = Device::Cpu;
        let attention = T5Attention::new(&tiny(), &device, DType::F32)?;
        let names: Vec<String> = attention
            .inner()
            .named_parameters()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(
            names,
            vec!["query.weight", "key.weight", "value.weight", "output.weight"]
        );
        Ok(())
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: T5Config =
            serde_json::from_str(r#"{"num_heads": 4, "is_decoder": true}"#).expect("valid json");
        assert_eq!(config.num_heads, 4);
        assert!(config.is_decoder);
        assert_eq!(config.hidden_size, 512);
    }
}
