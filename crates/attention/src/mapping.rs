//! Parameter naming for checkpoints produced by other toolkits.
//!
//! Pretrained attention weights arrive under the exporter's names
//! (`q.weight`, `q_lin.weight`, `encoder.layer.0...`). A [`ParameterMapping`]
//! rewrites those names segment by segment into the names
//! [`GeneralAttention::from_tensors`](crate::GeneralAttention::from_tensors)
//! expects.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::core::{AttentionError, Result};

/// Ordered table of dotted-name segment substitutions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterMapping {
    rules: Vec<(String, String)>,
}

impl ParameterMapping {
    pub fn new<I, S, T>(rules: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            rules: rules
                .into_iter()
                .map(|(from, to)| (from.into(), to.into()))
                .collect(),
        }
    }

    /// Names used by Hugging Face T5 attention blocks.
    pub fn huggingface_t5() -> Self {
        Self::new([
            ("q", "query"),
            ("k", "key"),
            ("v", "value"),
            ("o", "output"),
            ("layers", "layer"),
        ])
    }

    /// Names used by Hugging Face BERT self-attention blocks.
    pub fn huggingface_bert() -> Self {
        Self::new([("layer", "layers")])
    }

    /// Names used by DistilBERT multi-head attention blocks.
    pub fn distilbert() -> Self {
        Self::new([
            ("q_lin", "query"),
            ("k_lin", "key"),
            ("v_lin", "value"),
            ("out_lin", "output"),
            ("transformer", "encoder"),
        ])
    }

    /// Appends `other`'s rules; earlier rules win on conflicting sources.
    pub fn merged(mut self, other: &ParameterMapping) -> Self {
        for (from, to) in &other.rules {
            if !self.rules.iter().any(|(existing, _)| existing == from) {
                self.rules.push((from.clone(), to.clone()));
            }
        }
        self
    }

    pub fn rules(&self) -> &[(String, String)] {
        &self.rules
    }

    /// Rewrites every dotted segment of `name` that matches a rule.
    pub fn remap(&self, name: &str) -> String {
        name.split('.')
            .map(|segment| {
                self.rules
                    .iter()
                    .find(|(from, _)| from == segment)
                    .map_or(segment, |(_, to)| to.as_str())
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Remaps every tensor name.
    pub fn remap_all(&self, tensors: &HashMap<String, Tensor>) -> HashMap<String, Tensor> {
        tensors
            .iter()
            .map(|(name, tensor)| (self.remap(name), tensor.clone()))
            .collect()
    }
}

/// Head-count metadata shipped alongside a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadsHint {
    /// BERT-style `num_attention_heads`.
    pub num_attention_heads: Option<usize>,
    /// DistilBERT-style `n_heads`.
    pub n_heads: Option<usize>,
}

/// What [`detect_self_attention`] inferred about a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedSelfAttention {
    pub mapping: ParameterMapping,
    pub num_attention_heads: usize,
    pub output_projection: bool,
}

/// Picks the naming table and head count for a BERT-family checkpoint.
///
/// Names containing `q_lin` mark a DistilBERT export, whose attention block
/// carries its own output projection.
pub fn detect_self_attention<S: AsRef<str>>(
    names: &[S],
    hint: HeadsHint,
) -> Result<DetectedSelfAttention> {
    let distil = names.iter().any(|name| name.as_ref().contains("q_lin"));
    let mut mapping = ParameterMapping::huggingface_bert();
    if distil {
        mapping = mapping.merged(&ParameterMapping::distilbert());
    }

    let (num_attention_heads, from_n_heads) = match (hint.num_attention_heads, hint.n_heads) {
        (Some(heads), _) => (heads, false),
        (None, Some(heads)) => (heads, true),
        (None, None) => {
            return Err(AttentionError::config(
                "cannot find a relevant attribute for number of heads",
            ))
        }
    };
    log::debug!(
        "detected {} self-attention checkpoint with {} heads",
        if distil { "distilbert" } else { "bert" },
        num_attention_heads
    );

    Ok(DetectedSelfAttention {
        mapping,
        num_attention_heads,
        output_projection: distil || from_n_heads,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t5_names_map_to_projection_names() {
        let mapping = ParameterMapping::huggingface_t5();
        assert_eq!(mapping.remap("q.weight"), "query.weight");
        assert_eq!(mapping.remap("o.weight"), "output.weight");
        assert_eq!(
            mapping.remap("encoder.layers.0.k.weight"),
            "encoder.layer.0.key.weight"
        );
        assert_eq!(
            mapping.remap("relative_attention_bias.weight"),
            "relative_attention_bias.weight"
        );
    }

    #[test]
    fn only_whole_segments_are_rewritten() {
        let mapping = ParameterMapping::huggingface_bert();
        assert_eq!(
            mapping.remap("encoder.layer.3.attention.self.query.bias"),
            "encoder.layers.3.attention.self.query.bias"
        );
        assert_eq!(mapping.remap("layer_norm.weight"), "layer_norm.weight");
    }

    #[test]
    fn distilbert_names_switch_tables() -> Result<()> {
        let names = ["q_lin.weight", "k_lin.weight", "v_lin.weight", "out_lin.weight"];
        let detected = detect_self_attention(
            &names,
            HeadsHint {
                n_heads: Some(12),
                ..HeadsHint::default()
            },
        )?;
        assert_eq!(detected.num_attention_heads, 12);
        assert!(detected.output_projection);
        assert_eq!(
            detected.mapping.remap("transformer.layer.0.attention.out_lin.bias"),
            "encoder.layers.0.attention.output.bias"
        );
        Ok(())
    }

    #[test]
    fn bert_names_keep_plain_table() -> Result<()> {
        let names = ["query.weight", "key.weight", "value.weight"];
        let detected = detect_self_attention(
            &names,
            HeadsHint {
                num_attention_heads: Some(4),
                n_heads: Some(8),
            },
        )?;
        assert_eq!(detected.num_attention_heads, 4);
        assert!(!detected.output_projection);
        assert_eq!(detected.mapping, ParameterMapping::huggingface_bert());
        Ok(())
    }

    #[test]
    fn missing_head_count_is_rejected() {
        let err = detect_self_attention(&["query.weight"], HeadsHint::default()).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidConfig(_)));
    }
}
