//! Bucketed relative position bias (T5 / Mesh TensorFlow scheme).
//!
//! The signed distance `key_position - query_position` is mapped to one of
//! `num_buckets` integer buckets: small distances get a bucket each, larger
//! ones share logarithmically wider buckets up to `max_distance`, and anything
//! beyond lands in the last bucket. Each bucket indexes a learned per-head
//! scalar. Bucketing is integer-only and carries no gradient.

use candle_core::{DType, Device, Result, Tensor};
use layers::{Embedding, EmbeddingConfig};

/// Maps a signed relative position to a bucket in `[0, num_buckets)`.
///
/// With `bidirectional` the bucket range is split in half and positive
/// distances (keys after the query) use the upper half. Otherwise only
/// non-positive distances are meaningful and every future position maps to
/// bucket 0.
pub fn relative_position_bucket(
    relative_position: i64,
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
) -> usize {
    let mut num_buckets = num_buckets as i64;
    let mut bucket = 0i64;
    let distance = if bidirectional {
        num_buckets /= 2;
        if relative_position > 0 {
            bucket += num_buckets;
        }
        relative_position.abs()
    } else {
        -relative_position.min(0)
    };

    let max_exact = num_buckets / 2;
    bucket += if distance < max_exact {
        distance
    } else if max_exact == 0 {
        num_buckets - 1
    } else {
        // Evaluated in f32 to stay bit-compatible with reference checkpoints.
        let log_ratio = (distance as f32 / max_exact as f32).ln();
        let log_range = (max_distance as f64 / max_exact as f64).ln() as f32;
        // Capped before the cast: a zero log range makes `scaled` infinite.
        let scaled = (log_ratio / log_range * (num_buckets - max_exact) as f32)
            .min((num_buckets - 1 - max_exact) as f32);
        (max_exact + scaled as i64).clamp(0, num_buckets - 1)
    };
    bucket.max(0) as usize
}

/// Learned relative position bias shared across a layer's heads.
#[derive(Debug, Clone)]
pub struct RelativePositionBias {
    embedding: Embedding,
    num_heads: usize,
    num_buckets: usize,
    max_distance: usize,
    bidirectional: bool,
}

impl RelativePositionBias {
    /// Builds a `num_buckets x num_heads` table sampled from `N(0, init_std)`.
    pub fn new(
        num_buckets: usize,
        num_heads: usize,
        max_distance: usize,
        bidirectional: bool,
        init_std: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let config = EmbeddingConfig::new(num_buckets, num_heads).with_init_std(init_std);
        let embedding = Embedding::new(config, device, dtype)?;
        Ok(Self {
            embedding,
            num_heads,
            num_buckets,
            max_distance,
            bidirectional,
        })
    }

    /// Wraps an existing `num_buckets x num_heads` table.
    pub fn from_weight(
        weight: Tensor,
        max_distance: usize,
        bidirectional: bool,
    ) -> Result<Self> {
        let embedding = Embedding::from_weight(weight)?;
        let num_buckets = embedding.config().num_embeddings;
        let num_heads = embedding.config().embedding_dim;
        Ok(Self {
            embedding,
            num_heads,
            num_buckets,
            max_distance,
            bidirectional,
        })
    }

    pub fn weight(&self) -> &Tensor {
        self.embedding.weight()
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    pub fn is_bidirectional(&self) -> bool {
        self.bidirectional
    }

    /// Bucket ids for every `(query, key)` pair, row-major `[q_len, k_len]`.
    pub fn buckets(&self, query_length: usize, key_length: usize) -> Vec<u32> {
        let mut ids = Vec::with_capacity(query_length * key_length);
        for i in 0..query_length as i64 {
            for j in 0..key_length as i64 {
                let bucket = relative_position_bucket(
                    j - i,
                    self.bidirectional,
                    self.num_buckets,
                    self.max_distance,
                );
                ids.push(bucket as u32);
            }
        }
        ids
    }

    /// Bias tensor shaped `[1, heads, query_length, key_length]`.
    pub fn compute_bias(&self, query_length: usize, key_length: usize) -> Result<Tensor> {
        let device = self.embedding.weight().device();
        let ids = Tensor::from_vec(
            self.buckets(query_length, key_length),
            (query_length, key_length),
            device,
        )?;
        log::debug!(
            "relative bias q_len={} k_len={} buckets={} bidirectional={}",
            query_length,
            key_length,
            self.num_buckets,
            self.bidirectional
        );
        // [q, k, heads] -> [1, heads, q, k]
        self.embedding
            .forward(&ids)?
            .permute((2, 0, 1))?
            .unsqueeze(0)?
            .contiguous()
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }
}
