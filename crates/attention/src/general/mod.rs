//! The general attention engine.
//!
//! [`GeneralAttention`] covers self- and cross-attention, encoder and decoder
//! use (with incremental key/value state), every [`ScoringKind`], and an
//! optional learned relative position bias. The T5 and BERT conventions in
//! [`crate::variants`] are thin presets over this single type.
//!
//! Shapes:
//! * `query_states`, `source_states`: `[batch, seq, hidden]`.
//! * masks: keep masks, see [`crate::masks`].
//! * key/value state: `[batch, heads, past_len, head_dim]`.
//! * position bias: `[1 | batch, heads, q_len, k_len]`.

pub mod projection;

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};
use layers::PrecisionPolicy;

use crate::core::{AttentionConfig, AttentionError, InitScheme, Mode, Result};
use crate::kv_cache::KeyValueState;
use crate::masks::apply_mask;
use crate::relative_bias::RelativePositionBias;
use crate::scoring::{Scorer, ScoringFunction, ScoringKind};

pub use projection::Projections;

/// Optional inputs to [`GeneralAttention::forward`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardArgs<'a> {
    /// Keys from previous decoding steps (or cached encoder keys).
    pub past_key_states: Option<&'a Tensor>,
    /// Values from previous decoding steps (or cached encoder values).
    pub past_value_states: Option<&'a Tensor>,
    /// Keep mask over query-side keys. Ignored by cross-attention.
    pub attention_mask: Option<&'a Tensor>,
    /// Encoder output; required by cross-attention without a cache.
    pub source_states: Option<&'a Tensor>,
    /// Keep mask over source positions, used by cross-attention.
    pub source_attention_mask: Option<&'a Tensor>,
    /// Multiplier applied to the probabilities of each head.
    pub head_mask: Option<&'a Tensor>,
    /// Bias computed by a sibling layer; skips recomputation.
    pub position_bias: Option<&'a Tensor>,
    pub output_attentions: bool,
    pub use_cache: bool,
}

/// Results of one forward call.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Context representation `[batch, seq, hidden]`.
    pub hidden_states: Tensor,
    /// Extended key/value state when caching was requested by a decoder.
    pub key_value_state: Option<KeyValueState>,
    /// The masked bias added to the scores, for reuse by sibling layers.
    pub position_bias: Option<Tensor>,
    /// Attention probabilities `[batch, heads, q_len, k_len]` when requested.
    pub attention_probs: Option<Tensor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SeqLengths {
    seq_length: usize,
    effective_length: usize,
    key_length: usize,
}

/// Configurable multi-head attention block.
#[derive(Debug, Clone)]
pub struct GeneralAttention {
    config: AttentionConfig,
    projections: Projections,
    scorer: Scorer,
    relative_bias: Option<RelativePositionBias>,
    mode: Mode,
}

impl GeneralAttention {
    /// Validates `config` and samples fresh parameters on `device`.
    pub fn new(config: AttentionConfig, device: &Device, dtype: DType) -> Result<Self> {
        config.validate()?;
        let projections = Projections::new(&config, device, dtype)?;
        let scorer = Scorer::build(&config, device, dtype)?;
        let relative_bias = if config.has_relative_attention_bias {
            let init_std = match config.init {
                InitScheme::Standard => 1.0,
                InitScheme::Scaled => (config.hidden_size as f64).powf(-0.5),
            };
            Some(RelativePositionBias::new(
                config.relative_attention_num_buckets,
                config.num_attention_heads,
                config.relative_attention_max_distance,
                !config.is_decoder,
                init_std,
                device,
                dtype,
            )?)
        } else {
            None
        };
        Ok(Self::assemble(config, projections, scorer, relative_bias))
    }

    /// Builds the engine from named parameters, as listed by
    /// [`GeneralAttention::named_parameters`].
    pub fn from_tensors(config: AttentionConfig, tensors: &HashMap<String, Tensor>) -> Result<Self> {
        config.validate()?;
        let projections = Projections::from_tensors(&config, tensors)?;
        let scorer_params: HashMap<String, Tensor> = tensors
            .iter()
            .filter_map(|(name, tensor)| {
                name.strip_prefix("attn.")
                    .map(|rest| (rest.to_string(), tensor.clone()))
            })
            .collect();
        let scorer = Scorer::from_parameters(&config, &scorer_params)?;
        let relative_bias = if config.has_relative_attention_bias {
            let name = "relative_attention_bias.weight";
            let weight = tensors.get(name).cloned().ok_or(AttentionError::Parameter {
                name: name.to_string(),
                reason: "missing".to_string(),
            })?;
            let expected = [
                config.relative_attention_num_buckets,
                config.num_attention_heads,
            ];
            if weight.dims() != expected {
                return Err(AttentionError::Parameter {
                    name: name.to_string(),
                    reason: format!("expected shape {:?}, got {:?}", expected, weight.dims()),
                });
            }
            let storage = projections.policy().storage();
            if weight.dtype() != storage {
                return Err(AttentionError::Parameter {
                    name: name.to_string(),
                    reason: format!("expected dtype {:?}, got {:?}", storage, weight.dtype()),
                });
            }
            if !weight.device().same_device(projections.query.weight().device()) {
                return Err(AttentionError::Parameter {
                    name: name.to_string(),
                    reason: "stored on a different device than the projections".to_string(),
                });
            }
            Some(RelativePositionBias::from_weight(
                weight,
                config.relative_attention_max_distance,
                !config.is_decoder,
            )?)
        } else {
            None
        };
        Ok(Self::assemble(config, projections, scorer, relative_bias))
    }

    fn assemble(
        config: AttentionConfig,
        projections: Projections,
        scorer: Scorer,
        relative_bias: Option<RelativePositionBias>,
    ) -> Self {
        log::info!(
            "attention init hidden={} heads={} head_dim={} scoring={} output_projection={} decoder={} cross={} relative_bias={:?} dropout={} mixed_precision={}",
            config.hidden_size,
            config.num_attention_heads,
            config.attention_head_size,
            scorer.kind(),
            projections.has_output(),
            config.is_decoder,
            config.is_cross_attention,
            relative_bias.as_ref().map(|rb| rb.num_buckets()),
            config.dropout,
            projections.policy().is_mixed_precision()
        );
        Self {
            config,
            projections,
            scorer,
            relative_bias,
            mode: Mode::default(),
        }
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn scoring_kind(&self) -> ScoringKind {
        self.scorer.kind()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Switches dropout on (`Mode::Train`) or off (`Mode::Eval`).
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Dtypes used for storage, matmuls, and the softmax.
    pub fn precision(&self) -> &PrecisionPolicy {
        self.projections.policy()
    }

    pub fn relative_bias(&self) -> Option<&RelativePositionBias> {
        self.relative_bias.as_ref()
    }

    /// Bucketed relative position bias `[1, heads, query_length, key_length]`.
    pub fn compute_bias(&self, query_length: usize, key_length: usize) -> Result<Tensor> {
        let relative_bias = self.relative_bias.as_ref().ok_or_else(|| {
            AttentionError::config("compute_bias requires has_relative_attention_bias")
        })?;
        Ok(relative_bias.compute_bias(query_length, key_length)?)
    }

    /// Every trainable tensor keyed by its parameter name.
    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut params = self.projections.named_parameters();
        params.extend(
            self.scorer
                .named_parameters()
                .into_iter()
                .map(|(name, tensor)| (format!("attn.{name}"), tensor)),
        );
        if let Some(relative_bias) = &self.relative_bias {
            params.push((
                "relative_attention_bias.weight".to_string(),
                relative_bias.weight().clone(),
            ));
        }
        params
    }

    /// Runs attention for `query_states` shaped `[batch, seq, hidden]`.
    pub fn forward(&self, query_states: &Tensor, args: ForwardArgs<'_>) -> Result<AttentionOutput> {
        self.expect_hidden("query_states", query_states)?;
        if let Some(source) = args.source_states {
            self.expect_hidden("source_states", source)?;
        }
        let past = self.past_state(args.past_key_states, args.past_value_states)?;

        let query_layer = self
            .projections
            .project(&self.projections.query, query_states)?;
        let key_layer = self.project_key_value(
            KeyOrValue::Key,
            query_states,
            args.source_states,
            past.as_ref().map(|state| &state.key_state),
        )?;
        let value_layer = self.project_key_value(
            KeyOrValue::Value,
            query_states,
            args.source_states,
            past.as_ref().map(|state| &state.value_state),
        )?;
        let (key_layer, value_layer) = match &past {
            Some(past) if !self.config.is_cross_attention => {
                log::debug!("extending cached key/value state from {} positions", past.seq_len());
                let extended = past.extend(&key_layer, &value_layer)?;
                (extended.key_state, extended.value_state)
            }
            _ => (key_layer, value_layer),
        };

        let attention_mask = self.select_mask(args.attention_mask, args.source_attention_mask);
        let lengths = self.lengths(query_states, past.as_ref(), &key_layer)?;

        let scores = self
            .scorer
            .score(&query_layer, &key_layer.transpose(2, 3)?)?;

        let position_bias = self.position_bias(
            args.position_bias,
            lengths,
            past.is_some(),
            &scores,
        )?;
        let (scores, position_bias) = match position_bias {
            Some(bias) => {
                let bias = match attention_mask {
                    Some(mask) => apply_mask(&bias, mask)?,
                    None => bias,
                };
                (scores.broadcast_add(&bias)?, Some(bias))
            }
            None => match attention_mask {
                Some(mask) => (apply_mask(&scores, mask)?, None),
                None => (scores, None),
            },
        };

        let probs = self.normalize(&scores)?;
        let probs = match args.head_mask {
            Some(head_mask) => probs.broadcast_mul(&self.expand_head_mask(head_mask, &probs)?)?,
            None => probs,
        };

        let context = probs.matmul(&value_layer)?;
        let hidden_states = self.projections.merge(&context)?;

        let key_value_state = if self.config.is_decoder && args.use_cache {
            Some(KeyValueState::new(key_layer, value_layer))
        } else {
            None
        };

        Ok(AttentionOutput {
            hidden_states,
            key_value_state,
            position_bias,
            attention_probs: args.output_attentions.then_some(probs),
        })
    }

    fn expect_hidden(&self, name: &str, tensor: &Tensor) -> Result<()> {
        match tensor.dims() {
            [_, seq, hidden] if *seq > 0 && *hidden == self.config.hidden_size => Ok(()),
            dims => Err(AttentionError::shape(format!(
                "{name}: expected [batch, seq, {}], got {:?}",
                self.config.hidden_size, dims
            ))),
        }
    }

    /// Shared key/value routine parametrised by which projection to apply.
    fn project_key_value(
        &self,
        which: KeyOrValue,
        query_states: &Tensor,
        source_states: Option<&Tensor>,
        past: Option<&Tensor>,
    ) -> Result<Tensor> {
        let layer = match which {
            KeyOrValue::Key => &self.projections.key,
            KeyOrValue::Value => &self.projections.value,
        };

        if self.config.is_decoder && self.config.is_cross_attention {
            // The encoder output does not change between decoding steps.
            if let Some(past) = past {
                return Ok(past.clone());
            }
            let source = source_states.ok_or(AttentionError::MissingSource)?;
            return self.projections.project(layer, source);
        }

        self.projections.project(layer, query_states)
    }

    /// Cached state only has meaning inside a decoder, and keys and values
    /// must be cached together.
    fn past_state(
        &self,
        past_key_states: Option<&Tensor>,
        past_value_states: Option<&Tensor>,
    ) -> Result<Option<KeyValueState>> {
        if !self.config.is_decoder {
            return Ok(None);
        }
        match (past_key_states, past_value_states) {
            (Some(key), Some(value)) => {
                if key.dims() != value.dims() {
                    return Err(AttentionError::shape(format!(
                        "past key/value states: {:?} vs {:?}",
                        key.dims(),
                        value.dims()
                    )));
                }
                Ok(Some(KeyValueState::new(key.clone(), value.clone())))
            }
            (None, None) => Ok(None),
            _ => Err(AttentionError::shape(
                "past_key_states and past_value_states must be given together",
            )),
        }
    }

    /// Cross-attention masks source positions, so the source mask replaces
    /// whatever query-side mask the caller passed.
    fn select_mask<'a>(
        &self,
        attention_mask: Option<&'a Tensor>,
        source_attention_mask: Option<&'a Tensor>,
    ) -> Option<&'a Tensor> {
        if self.config.is_cross_attention {
            if attention_mask.is_some() {
                log::warn!("cross-attention ignores attention_mask; pass source_attention_mask");
            }
            source_attention_mask
        } else {
            attention_mask
        }
    }

    fn lengths(
        &self,
        query_states: &Tensor,
        past: Option<&KeyValueState>,
        key_layer: &Tensor,
    ) -> Result<SeqLengths> {
        let seq_length = query_states.dim(1)?;
        let past_length = past.map_or(0, KeyValueState::seq_len);
        Ok(SeqLengths {
            seq_length,
            effective_length: seq_length + past_length,
            key_length: key_layer.dim(2)?,
        })
    }

    fn position_bias(
        &self,
        supplied: Option<&Tensor>,
        lengths: SeqLengths,
        has_past: bool,
        scores: &Tensor,
    ) -> Result<Option<Tensor>> {
        if let Some(bias) = supplied {
            return Ok(Some(bias.to_dtype(scores.dtype())?));
        }
        let SeqLengths {
            seq_length,
            effective_length,
            key_length,
        } = lengths;
        let bias = match &self.relative_bias {
            Some(relative_bias) => relative_bias
                .compute_bias(effective_length, key_length)?
                .to_dtype(scores.dtype())?,
            None => Tensor::zeros(
                (1, self.config.num_attention_heads, effective_length, key_length),
                scores.dtype(),
                scores.device(),
            )?,
        };
        // Earlier query rows were consumed by previous decoding steps.
        let bias = if has_past {
            bias.narrow(2, effective_length - seq_length, seq_length)?
                .contiguous()?
        } else {
            bias
        };
        Ok(Some(bias))
    }

    /// Softmax over keys (in the reduction dtype) followed by train-time dropout.
    fn normalize(&self, scores: &Tensor) -> Result<Tensor> {
        let policy = self.projections.policy();
        let scores = policy.cast_for_reduction(scores)?.contiguous()?;
        let probs = policy.cast_to_storage(&softmax_last_dim(&scores)?)?;
        // Dropping whole probability entries removes entire attended-to tokens.
        if self.mode == Mode::Train && self.config.dropout > 0.0 {
            Ok(dropout(&probs, self.config.dropout)?)
        } else {
            Ok(probs)
        }
    }

    fn expand_head_mask(&self, head_mask: &Tensor, probs: &Tensor) -> Result<Tensor> {
        let head_mask = head_mask.to_dtype(probs.dtype())?;
        if head_mask.rank() == 1 {
            let heads = head_mask.dim(0)?;
            if heads != self.config.num_attention_heads {
                return Err(AttentionError::shape(format!(
                    "head_mask: expected {} heads, got {heads}",
                    self.config.num_attention_heads
                )));
            }
            Ok(head_mask.reshape((1, heads, 1, 1))?)
        } else {
            Ok(head_mask)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum KeyOrValue {
    Key,
    Value,
}
