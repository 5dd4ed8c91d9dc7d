//! Learnable lookup table mapping integer ids to dense vectors.

use candle_core::{bail, DType, Device, Result, Tensor};

use crate::checks;

/// Configuration for building an embedding table.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingConfig {
    /// Number of distinct ids (rows in the table).
    pub num_embeddings: usize,
    /// Dimensionality of each embedding vector.
    pub embedding_dim: usize,
    /// Standard deviation of the `N(0, std)` initialisation.
    pub init_std: f64,
}

impl EmbeddingConfig {
    /// Table with the conventional `N(0, 1)` initialisation.
    pub fn new(num_embeddings: usize, embedding_dim: usize) -> Self {
        Self {
            num_embeddings,
            embedding_dim,
            init_std: 1.0,
        }
    }

    /// Overrides the initialisation standard deviation.
    pub fn with_init_std(mut self, init_std: f64) -> Self {
        self.init_std = init_std;
        self
    }
}

/// Embedding table shaped `(num_embeddings, embedding_dim)`.
#[derive(Debug, Clone)]
pub struct Embedding {
    config: EmbeddingConfig,
    weight: Tensor,
}

impl Embedding {
    /// Builds a new table and samples the parameters from `N(0, init_std)`.
    pub fn new(config: EmbeddingConfig, device: &Device, dtype: DType) -> Result<Self> {
        if config.num_embeddings == 0 {
            bail!("embedding requires num_embeddings > 0");
        }
        if config.embedding_dim == 0 {
            bail!("embedding requires embedding_dim > 0");
        }
        if config.init_std <= 0.0 {
            bail!("embedding init_std must be positive, got {}", config.init_std);
        }
        let shape = (config.num_embeddings, config.embedding_dim);
        let weight = Tensor::randn(0f32, config.init_std as f32, shape, device)?;
        let weight = if dtype == DType::F32 {
            weight
        } else {
            weight.to_dtype(dtype)?
        };
        Ok(Self { config, weight })
    }

    /// Wraps an existing weight tensor.
    pub fn from_weight(weight: Tensor) -> Result<Self> {
        checks::expect_rank("embedding.weight", &weight, 2)?;
        checks::expect_dtype_in("embedding.weight", &weight, &checks::FLOAT_DTYPES)?;
        let (num_embeddings, embedding_dim) = weight.dims2()?;
        Ok(Self {
            config: EmbeddingConfig::new(num_embeddings, embedding_dim),
            weight,
        })
    }

    /// Returns the embedding configuration.
    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    /// Returns the underlying weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Looks up embeddings for the provided ids.
    ///
    /// `ids` may have any shape and an integer dtype; the output appends
    /// `embedding_dim` as a trailing dimension.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        if !ids.dtype().is_int() {
            bail!(
                "embedding ids expected integer dtype but received {:?}",
                ids.dtype()
            );
        }
        let flat = ids.flatten_all()?;
        if flat.elem_count() > 0 {
            let max_id = flat.to_dtype(DType::I64)?.max_all()?.to_scalar::<i64>()?;
            if max_id >= self.config.num_embeddings as i64 {
                bail!(
                    "embedding id {} exceeds table size {}",
                    max_id,
                    self.config.num_embeddings
                );
            }
        }
        let gathered = self.weight.index_select(&flat, 0)?;
        let mut output_dims = ids.dims().to_vec();
        output_dims.push(self.config.embedding_dim);
        gathered.reshape(output_dims)
    }
}
