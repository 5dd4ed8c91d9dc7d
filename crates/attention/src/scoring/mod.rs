//! Scoring functions turning query/key pairs into raw attention scores.
//!
//! Every scorer receives queries shaped `[batch, heads, q_len, head_dim]` and
//! transposed keys shaped `[batch, heads, head_dim, k_len]`, and returns
//! unnormalised scores shaped `[batch, heads, q_len, k_len]`. The supported set
//! is closed: a [`ScoringKind`] tag is resolved once at construction into a
//! [`Scorer`] that owns any trainable parameters.

pub mod dot;
pub mod learned;

use std::{collections::HashMap, fmt, str::FromStr};

use candle_core::{DType, Device, Result as CandleResult, Tensor};
use serde::{Deserialize, Serialize};

use crate::core::{AttentionConfig, AttentionError, Result};

pub use dot::{Cosine, DotProduct, ScaledDotProduct};
pub use learned::{Additive, Bilinear, LinearScore};

/// Identifier of a supported scoring function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringKind {
    DotProduct,
    ScaledDotProduct,
    Cosine,
    Bilinear,
    Additive,
    Linear,
}

impl ScoringKind {
    pub const ALL: [ScoringKind; 6] = [
        ScoringKind::DotProduct,
        ScoringKind::ScaledDotProduct,
        ScoringKind::Cosine,
        ScoringKind::Bilinear,
        ScoringKind::Additive,
        ScoringKind::Linear,
    ];

    /// The snake_case identifier used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoringKind::DotProduct => "dot_product",
            ScoringKind::ScaledDotProduct => "scaled_dot_product",
            ScoringKind::Cosine => "cosine",
            ScoringKind::Bilinear => "bilinear",
            ScoringKind::Additive => "additive",
            ScoringKind::Linear => "linear",
        }
    }

    /// Whether the scorer owns trainable parameters.
    pub fn is_trainable(&self) -> bool {
        matches!(
            self,
            ScoringKind::Bilinear | ScoringKind::Additive | ScoringKind::Linear
        )
    }
}

impl fmt::Display for ScoringKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScoringKind {
    type Err = AttentionError;

    fn from_str(s: &str) -> Result<Self> {
        ScoringKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| AttentionError::UnknownScoringFunction(s.to_string()))
    }
}

/// Shared interface for scoring functions.
pub trait ScoringFunction {
    /// Tag this scorer was resolved from.
    fn kind(&self) -> ScoringKind;

    /// Computes raw scores from queries and transposed keys.
    fn score(&self, query: &Tensor, key_t: &Tensor) -> CandleResult<Tensor>;

    /// Trainable parameters, keyed by their name relative to the scorer.
    fn named_parameters(&self) -> Vec<(&'static str, Tensor)> {
        Vec::new()
    }
}

/// A scoring function resolved from configuration.
#[derive(Debug, Clone)]
pub enum Scorer {
    DotProduct(DotProduct),
    ScaledDotProduct(ScaledDotProduct),
    Cosine(Cosine),
    Bilinear(Bilinear),
    Additive(Additive),
    Linear(LinearScore),
}

impl Scorer {
    /// Builds the scorer named by `config.scoring_func`, sampling fresh
    /// parameters for trainable variants.
    pub fn build(config: &AttentionConfig, device: &Device, dtype: DType) -> Result<Self> {
        let dim = config.attention_head_size;
        let scorer = match config.scoring_func {
            ScoringKind::DotProduct => Scorer::DotProduct(DotProduct),
            ScoringKind::ScaledDotProduct => Scorer::ScaledDotProduct(ScaledDotProduct::new(
                config.effective_scaling_factor(),
            )),
            ScoringKind::Cosine => Scorer::Cosine(Cosine),
            ScoringKind::Bilinear => Scorer::Bilinear(Bilinear::new(dim, device, dtype)?),
            ScoringKind::Additive => Scorer::Additive(Additive::new(dim, device, dtype)?),
            ScoringKind::Linear => Scorer::Linear(LinearScore::new(dim, device, dtype)?),
        };
        Ok(scorer)
    }

    /// Builds the scorer named by `config.scoring_func` from named parameters.
    ///
    /// `params` is keyed by the names returned from
    /// [`ScoringFunction::named_parameters`].
    pub fn from_parameters(
        config: &AttentionConfig,
        params: &HashMap<String, Tensor>,
    ) -> Result<Self> {
        let dim = config.attention_head_size;
        let fetch = |name: &str| {
            params.get(name).cloned().ok_or_else(|| AttentionError::Parameter {
                name: format!("attn.{name}"),
                reason: "missing".to_string(),
            })
        };
        let scorer = match config.scoring_func {
            ScoringKind::Bilinear => {
                Scorer::Bilinear(Bilinear::from_parts(dim, fetch("weight_matrix")?, fetch("bias")?)?)
            }
            ScoringKind::Additive => Scorer::Additive(Additive::from_parts(
                dim,
                fetch("w_matrix")?,
                fetch("u_matrix")?,
                fetch("v_vector")?,
            )?),
            ScoringKind::Linear => Scorer::Linear(LinearScore::from_parts(
                dim,
                fetch("weight_vector")?,
                fetch("bias")?,
            )?),
            _ => Scorer::build(config, &Device::Cpu, DType::F32)?,
        };
        Ok(scorer)
    }

    fn inner(&self) -> &dyn ScoringFunction {
        match self {
            Scorer::DotProduct(s) => s,
            Scorer::ScaledDotProduct(s) => s,
            Scorer::Cosine(s) => s,
            Scorer::Bilinear(s) => s,
            Scorer::Additive(s) => s,
            Scorer::Linear(s) => s,
        }
    }
}

impl ScoringFunction for Scorer {
    fn kind(&self) -> ScoringKind {
        self.inner().kind()
    }

    fn score(&self, query: &Tensor, key_t: &Tensor) -> CandleResult<Tensor> {
        self.inner().score(query, key_t)
    }

    fn named_parameters(&self) -> Vec<(&'static str, Tensor)> {
        self.inner().named_parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_round_trip_through_from_str() {
        for kind in ScoringKind::ALL {
            assert_eq!(kind.as_str().parse::<ScoringKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_identifier_is_a_configuration_error() {
        let err = "softmax_of_doom".parse::<ScoringKind>().unwrap_err();
        assert!(matches!(err, AttentionError::UnknownScoringFunction(ref s) if s == "softmax_of_doom"));
    }

    #[test]
    fn every_kind_scores_with_the_expected_shape() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (2, 2, 3, 4), &device)?;
        let k_t = Tensor::randn(0f32, 1.0, (2, 2, 4, 5), &device)?;
        for kind in ScoringKind::ALL {
            let config = AttentionConfig::new(8, 4, 2).with_scoring(kind);
            let scorer = Scorer::build(&config, &device, DType::F32)?;
            assert_eq!(scorer.kind(), kind);
            let scores = scorer.score(&q, &k_t)?;
            assert_eq!(scores.dims(), &[2, 2, 3, 5], "{kind}");
            assert_eq!(scorer.named_parameters().is_empty(), !kind.is_trainable());
        }
        Ok(())
    }

    #[test]
    fn learned_scorers_reload_from_their_parameters() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 2, 3, 4), &device)?;
        let k_t = Tensor::randn(0f32, 1.0, (1, 2, 4, 3), &device)?;
        for kind in [ScoringKind::Bilinear, ScoringKind::Additive, ScoringKind::Linear] {
            let config = AttentionConfig::new(8, 4, 2).with_scoring(kind);
            let original = Scorer::build(&config, &device, DType::F32)?;
            let params: HashMap<String, Tensor> = original
                .named_parameters()
                .into_iter()
                .map(|(name, tensor)| (name.to_string(), tensor))
                .collect();
            let reloaded = Scorer::from_parameters(&config, &params)?;
            let diff = original
                .score(&q, &k_t)?
                .sub(&reloaded.score(&q, &k_t)?)?
                .abs()?
                .max_all()?
                .to_vec0::<f32>()?;
            assert_eq!(diff, 0.0, "{kind}");
        }
        Ok(())
    }
}
