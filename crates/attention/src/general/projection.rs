//! Query/key/value/output projections and the head split/merge reshapes.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use layers::{Linear, LinearConfig, LinearInit, PrecisionPolicy};

use crate::core::{AttentionConfig, AttentionError, InitScheme, Result};

/// Learned linear maps owned by one attention block.
#[derive(Debug, Clone)]
pub struct Projections {
    pub(crate) query: Linear,
    pub(crate) key: Linear,
    pub(crate) value: Linear,
    pub(crate) output: Option<Linear>,
    num_heads: usize,
    head_dim: usize,
    policy: PrecisionPolicy,
}

impl Projections {
    /// Samples fresh projections following `config.init`.
    pub fn new(config: &AttentionConfig, device: &Device, dtype: DType) -> Result<Self> {
        let hidden = config.hidden_size as f64;
        let head_dim = config.attention_head_size as f64;
        let heads = config.num_attention_heads as f64;
        let (query_init, kv_init, output_init) = match config.init {
            InitScheme::Standard => (
                LinearInit::standard(),
                LinearInit::standard(),
                LinearInit::standard(),
            ),
            InitScheme::Scaled => (
                LinearInit::Normal {
                    std: (hidden * head_dim).powf(-0.5),
                },
                LinearInit::Normal {
                    std: hidden.powf(-0.5),
                },
                LinearInit::Normal {
                    std: (heads * head_dim).powf(-0.5),
                },
            ),
        };

        let input_config = Self::input_config(config);
        let query = Linear::with_init(input_config.clone(), &query_init, device, dtype)?;
        let key = Linear::with_init(input_config.clone(), &kv_init, device, dtype)?;
        let value = Linear::with_init(input_config, &kv_init, device, dtype)?;
        let output = if config.output_projection {
            Some(Linear::with_init(
                Self::output_config(config),
                &output_init,
                device,
                dtype,
            )?)
        } else {
            None
        };

        Ok(Self::assemble(config, query, key, value, output, dtype))
    }

    /// Builds projections from tensors named `{query,key,value,output}.{weight,bias}`.
    pub fn from_tensors(config: &AttentionConfig, tensors: &HashMap<String, Tensor>) -> Result<Self> {
        let input_config = Self::input_config(config);
        let query = load_linear("query", input_config.clone(), tensors)?;
        let key = load_linear("key", input_config.clone(), tensors)?;
        let value = load_linear("value", input_config, tensors)?;
        let output = if config.output_projection {
            Some(load_linear("output", Self::output_config(config), tensors)?)
        } else {
            None
        };
        let dtype = query.weight().dtype();
        Ok(Self::assemble(config, query, key, value, output, dtype))
    }

    fn assemble(
        config: &AttentionConfig,
        query: Linear,
        key: Linear,
        value: Linear,
        output: Option<Linear>,
        dtype: DType,
    ) -> Self {
        Self {
            query,
            key,
            value,
            output,
            num_heads: config.num_attention_heads,
            head_dim: config.attention_head_size,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        }
    }

    fn input_config(config: &AttentionConfig) -> LinearConfig {
        LinearConfig::new(config.hidden_size, config.all_head_size()).with_bias(config.bias)
    }

    fn output_config(config: &AttentionConfig) -> LinearConfig {
        LinearConfig::new(config.all_head_size(), config.hidden_size).with_bias(config.bias)
    }

    pub fn policy(&self) -> &PrecisionPolicy {
        &self.policy
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// Applies `layer` and splits heads: `[b, s, hidden] -> [b, heads, s, head_dim]`.
    pub fn project(&self, layer: &Linear, hidden: &Tensor) -> Result<Tensor> {
        let projected = layer.forward(hidden, &self.policy)?;
        let (batch, seq, _) = projected.dims3()?;
        Ok(projected
            .reshape((batch, seq, self.num_heads, self.head_dim))?
            .permute((0, 2, 1, 3))?
            .contiguous()?)
    }

    /// Merges heads and applies the output projection when present:
    /// `[b, heads, s, head_dim] -> [b, s, hidden]`.
    pub fn merge(&self, context: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq, head_dim) = context.dims4()?;
        let merged = context
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((batch, seq, heads * head_dim))?;
        match &self.output {
            Some(output) => Ok(output.forward(&merged, &self.policy)?),
            None => Ok(merged),
        }
    }

    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut params = Vec::new();
        let layers = [
            Some(("query", &self.query)),
            Some(("key", &self.key)),
            Some(("value", &self.value)),
            self.output.as_ref().map(|output| ("output", output)),
        ];
        for (name, layer) in layers.into_iter().flatten() {
            params.push((format!("{name}.weight"), layer.weight().clone()));
            if let Some(bias) = layer.bias() {
                params.push((format!("{name}.bias"), bias.clone()));
            }
        }
        params
    }
}

fn load_linear(
    name: &str,
    config: LinearConfig,
    tensors: &HashMap<String, Tensor>,
) -> Result<Linear> {
    let weight_name = format!("{name}.weight");
    let weight = tensors
        .get(&weight_name)
        .cloned()
        .ok_or_else(|| AttentionError::Parameter {
            name: weight_name.clone(),
            reason: "missing".to_string(),
        })?;
    let bias = if config.bias {
        let bias_name = format!("{name}.bias");
        Some(tensors.get(&bias_name).cloned().ok_or(AttentionError::Parameter {
            name: bias_name,
            reason: "missing".to_string(),
        })?)
    } else {
        None
    };
    Linear::new(config, weight, bias).map_err(|err| AttentionError::Parameter {
        name: weight_name,
        reason: err.to_string(),
    })
}
